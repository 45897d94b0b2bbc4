//! `HsHaServer`: lifecycle manager.
//!
//! `serve()` turns the calling thread into the server's control thread:
//!
//! 1. start the worker pool
//! 2. bind the listening socket
//! 3. start the selector thread
//! 4. block until the selector exits (`stop()`, fatal error, or panic)
//! 5. drain the pool, bounded by `shutdown_timeout`
//! 6. flush late responses and close every socket
//!
//! The pool exists before anything is accepted and the socket exists
//! before the selector polls it. A failure in steps 1-3 releases what
//! was acquired and returns the error; there is no restart.

use hsha_core::config::ServerConfig;
use hsha_core::dispatch::FrameDispatch;
use hsha_core::error::{panic_message, HshaError, Result};
use hsha_core::pool::WorkerPool;
use hsha_core::processor::Processor;
use hsha_core::state::{ServerState, StateCell};
use hsha_core::{log_debug, log_error, log_info, log_warn};

use hsha_module::elastic_pool::ElasticPool;
use hsha_module::selector::{Selector, SelectorConfig, SelectorHandle};

use crate::invoker::Invoker;

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub struct HsHaServer {
    config: ServerConfig,
    processor: Arc<dyn Processor>,
    state: StateCell,
    stop_requested: AtomicBool,
    selector: Mutex<Option<SelectorHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
    invoker: Mutex<Option<Arc<Invoker<ElasticPool>>>>,
}

impl HsHaServer {
    pub fn new<P: Processor>(processor: P, config: ServerConfig) -> Result<Self> {
        Self::with_shared_processor(Arc::new(processor), config)
    }

    pub fn with_shared_processor(processor: Arc<dyn Processor>, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            processor,
            state: StateCell::new(),
            stop_requested: AtomicBool::new(false),
            selector: Mutex::new(None),
            local_addr: Mutex::new(None),
            invoker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    /// Bound address, once the listening socket exists. Resolves port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn wait_for_state<F>(&self, pred: F, timeout: Duration) -> ServerState
    where
        F: FnMut(ServerState) -> bool,
    {
        self.state.wait_for(pred, timeout)
    }

    /// Block until the server is bound (`Some(addr)`) or has stopped or
    /// the timeout passed (`None`).
    pub fn wait_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        self.state
            .wait_for(|s| s.is_stopped() || self.local_addr().is_some(), timeout);
        match self.state() {
            ServerState::Listening => self.local_addr(),
            _ => None,
        }
    }

    /// Run the server on the calling thread until `stop()`.
    pub fn serve(&self) -> Result<()> {
        if !self.state.advance(ServerState::NotStarted, ServerState::Listening) {
            return Err(HshaError::AlreadyStarted);
        }

        let pool = match self.start_invoker_pool() {
            Ok(pool) => pool,
            Err(e) => return self.abort(e),
        };

        let selector = match self.start_listening(&pool) {
            Ok(selector) => selector,
            Err(e) => {
                pool.shutdown();
                return self.abort(e);
            }
        };

        let selector_thread = match self.start_selector_thread(selector) {
            Ok(handle) => handle,
            Err(e) => {
                pool.shutdown();
                return self.abort(e);
            }
        };

        // Returns once the selector loop has exited.
        let (selector, outcome) = self.join_selector(selector_thread);
        self.shut_down(&*pool, selector, outcome)
    }

    /// Frames handed to the worker pool so far. Zero before `serve()`.
    pub fn dispatched(&self) -> u64 {
        lock(&self.invoker).as_ref().map_or(0, |i| i.dispatched())
    }

    /// Frames the worker pool refused; each one closed its connection.
    pub fn rejected(&self) -> u64 {
        lock(&self.invoker).as_ref().map_or(0, |i| i.rejected())
    }

    /// Ask a running server to stop. Safe from any thread, in any state,
    /// any number of times. Returns without waiting.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.selector).as_ref() {
            handle.stop();
        }
    }

    fn start_invoker_pool(&self) -> Result<Arc<ElasticPool>> {
        ElasticPool::from_server_config(&self.config).map(Arc::new)
    }

    fn start_listening(&self, pool: &Arc<ElasticPool>) -> Result<Selector> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr).map_err(HshaError::Bind)?;
        let invoker = Arc::new(Invoker::new(Arc::clone(pool)));
        let selector = Selector::new(
            listener,
            Arc::clone(&invoker) as Arc<dyn FrameDispatch>,
            Arc::clone(&self.processor),
            SelectorConfig::from(&self.config),
        )?;

        *lock(&self.invoker) = Some(invoker);
        *lock(&self.local_addr) = Some(selector.local_addr());
        *lock(&self.selector) = Some(selector.handle());
        // stop() may have run before the handle existed.
        if self.stop_requested.load(Ordering::SeqCst) {
            selector.handle().stop();
        }
        self.state.notify_waiters();
        Ok(selector)
    }

    fn start_selector_thread(
        &self,
        mut selector: Selector,
    ) -> Result<thread::JoinHandle<(Selector, Result<()>)>> {
        thread::Builder::new()
            .name("hsha-selector".into())
            .spawn(move || {
                let outcome = selector.run();
                (selector, outcome)
            })
            .map_err(HshaError::Spawn)
    }

    /// A selector that panicked is treated like one that was stopped.
    fn join_selector(
        &self,
        handle: thread::JoinHandle<(Selector, Result<()>)>,
    ) -> (Option<Selector>, Result<()>) {
        match handle.join() {
            Ok((selector, outcome)) => (Some(selector), outcome),
            Err(payload) => {
                log_error!("selector thread panicked: {}", panic_message(&*payload));
                (None, Ok(()))
            }
        }
    }

    /// Everything after the selector is gone, whichever way it went:
    /// drain the pool, flush and close sockets, reach `Stopped`, and
    /// hand back the selector's outcome.
    fn shut_down(
        &self,
        pool: &dyn WorkerPool,
        selector: Option<Selector>,
        outcome: Result<()>,
    ) -> Result<()> {
        self.state.advance(ServerState::Listening, ServerState::ShuttingDown);
        self.gracefully_shutdown_invoker_pool(pool);

        if let Some(mut selector) = selector {
            selector.flush_completed();
            selector.close_all();
        }
        *lock(&self.selector) = None;

        self.state.advance(ServerState::ShuttingDown, ServerState::Stopped);
        match outcome {
            Ok(()) => log_info!("server stopped"),
            Err(ref e) => log_error!("server stopped after selector failure: {}", e),
        }
        outcome
    }

    fn gracefully_shutdown_invoker_pool(&self, pool: &dyn WorkerPool) {
        pool.shutdown();

        let timeout = self.config.shutdown_timeout;
        let start = Instant::now();
        if pool.await_termination(timeout) {
            log_debug!("worker pool drained in {:?}", start.elapsed());
        } else {
            let s = pool.stats();
            log_warn!(
                "worker pool not drained after {:?}, abandoning {} workers ({} running, {} queued)",
                timeout,
                s.total,
                s.active,
                s.queued
            );
        }
    }

    fn abort(&self, e: HshaError) -> Result<()> {
        log_error!("server failed to start: {}", e);
        self.state.advance(ServerState::Listening, ServerState::Stopped);
        Err(e)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsha_module::framed::{read_frame, write_frame};
    use std::io;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ServerConfig {
        ServerConfig::new()
            .loopback_ephemeral()
            .min_worker_threads(2)
            .max_worker_threads(4)
            .shutdown_timeout(Duration::from_secs(2))
    }

    fn echo(req: &[u8], resp: &mut Vec<u8>) -> Result<()> {
        resp.extend_from_slice(req);
        Ok(())
    }

    /// `slow:<ms>` sleeps before echoing, `panic` panics, `fail` errors.
    fn scripted(req: &[u8], resp: &mut Vec<u8>) -> Result<()> {
        let text = std::str::from_utf8(req).unwrap_or("");
        if let Some(ms) = text.strip_prefix("slow:") {
            let ms: u64 = ms.parse().unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
        } else if text == "panic" {
            panic!("scripted handler panic");
        } else if text == "fail" {
            return Err(HshaError::Handler("scripted failure".into()));
        }
        resp.extend_from_slice(req);
        Ok(())
    }

    fn run(server: &Arc<HsHaServer>) -> (SocketAddr, thread::JoinHandle<Result<()>>) {
        let s = Arc::clone(server);
        let join = thread::spawn(move || s.serve());
        let addr = server
            .wait_listening(Duration::from_secs(5))
            .expect("server did not start listening");
        (addr, join)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let s = TcpStream::connect(addr).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        s
    }

    fn call(addr: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut s = connect(addr);
        write_frame(&mut s, payload)?;
        read_frame(&mut s)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = HsHaServer::new(echo, config().min_worker_threads(0)).err().unwrap();
        assert!(matches!(err, HshaError::InvalidConfig(_)));
    }

    #[test]
    fn test_serve_echo_then_stop() {
        let server = Arc::new(HsHaServer::new(echo, config()).unwrap());
        assert_eq!(server.state(), ServerState::NotStarted);
        let (addr, join) = run(&server);
        assert_eq!(server.state(), ServerState::Listening);

        assert_eq!(call(addr, b"ping").unwrap(), b"ping");
        assert_eq!(server.dispatched(), 1);
        assert_eq!(server.rejected(), 0);

        let start = Instant::now();
        server.stop();
        join.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(server.state(), ServerState::Stopped);

        // Listening socket is gone.
        assert!(TcpStream::connect(addr).is_err() || call(addr, b"again").is_err());
    }

    #[test]
    fn test_stop_is_idempotent_in_every_state() {
        let server = Arc::new(HsHaServer::new(echo, config()).unwrap());
        server.stop();
        server.stop();
        // A stop issued before serve() makes serve() pass straight through.
        server.serve().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_serve_cannot_restart() {
        let server = Arc::new(HsHaServer::new(echo, config()).unwrap());
        server.stop();
        server.serve().unwrap();
        assert!(matches!(server.serve(), Err(HshaError::AlreadyStarted)));
    }

    #[test]
    fn test_bind_failure_stops_server() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = HsHaServer::new(echo, config().port(port)).unwrap();

        let err = server.serve().unwrap_err();
        assert!(matches!(err, HshaError::Bind(_)));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());
        assert!(server.wait_listening(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_six_slow_requests_finish_in_two_batches() {
        let server = Arc::new(HsHaServer::new(scripted, config()).unwrap());
        let (addr, join) = run(&server);

        let start = Instant::now();
        let clients: Vec<_> = (0..6)
            .map(|_| thread::spawn(move || call(addr, b"slow:500")))
            .collect();
        for c in clients {
            assert_eq!(c.join().unwrap().unwrap(), b"slow:500");
        }
        let elapsed = start.elapsed();
        assert!(elapsed <= Duration::from_millis(1500), "{:?}", elapsed);

        let stop = Instant::now();
        server.stop();
        join.join().unwrap().unwrap();
        assert!(stop.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_one_invocation_in_flight_per_connection() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let processor = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |req: &[u8], resp: &mut Vec<u8>| -> Result<()> {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(150));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                resp.extend_from_slice(req);
                Ok(())
            }
        };
        let server = Arc::new(HsHaServer::new(processor, config()).unwrap());
        let (addr, join) = run(&server);

        let mut s = connect(addr);
        for payload in [&b"a"[..], b"b", b"c"] {
            write_frame(&mut s, payload).unwrap();
        }
        assert_eq!(read_frame(&mut s).unwrap(), b"a");
        assert_eq!(read_frame(&mut s).unwrap(), b"b");
        assert_eq!(read_frame(&mut s).unwrap(), b"c");
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        server.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_connections_complete_out_of_arrival_order() {
        let server = Arc::new(HsHaServer::new(scripted, config()).unwrap());
        let (addr, join) = run(&server);

        let slow = thread::spawn(move || {
            let r = call(addr, b"slow:600");
            (r, Instant::now())
        });
        thread::sleep(Duration::from_millis(100));
        let fast = thread::spawn(move || {
            let r = call(addr, b"fast");
            (r, Instant::now())
        });

        let (slow_resp, slow_done) = slow.join().unwrap();
        let (fast_resp, fast_done) = fast.join().unwrap();
        assert_eq!(slow_resp.unwrap(), b"slow:600");
        assert_eq!(fast_resp.unwrap(), b"fast");
        assert!(fast_done < slow_done);

        server.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_worker_survives_panicking_handler() {
        let cfg = config().min_worker_threads(1).max_worker_threads(1);
        let server = Arc::new(HsHaServer::new(scripted, cfg).unwrap());
        let (addr, join) = run(&server);

        assert!(call(addr, b"panic").is_err());
        assert!(call(addr, b"fail").is_err());
        assert_eq!(call(addr, b"still here").unwrap(), b"still here");

        server.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_stop_lets_queued_and_running_work_finish() {
        let done = Arc::new(AtomicUsize::new(0));
        let processor = {
            let done = Arc::clone(&done);
            move |req: &[u8], resp: &mut Vec<u8>| -> Result<()> {
                thread::sleep(Duration::from_millis(200));
                done.fetch_add(1, Ordering::SeqCst);
                resp.extend_from_slice(req);
                Ok(())
            }
        };
        let cfg = config().min_worker_threads(1).max_worker_threads(1);
        let server = Arc::new(HsHaServer::new(processor, cfg).unwrap());
        let (addr, join) = run(&server);

        // One running, three queued behind it.
        let mut conns: Vec<TcpStream> = (0..4).map(|_| connect(addr)).collect();
        for c in conns.iter_mut() {
            write_frame(c, b"work").unwrap();
        }
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        server.stop();
        join.join().unwrap().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stuck_handler_bounds_shutdown_at_timeout() {
        let release = Arc::new(AtomicBool::new(false));
        let processor = {
            let release = Arc::clone(&release);
            move |_req: &[u8], _resp: &mut Vec<u8>| -> Result<()> {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !release.load(Ordering::SeqCst) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
                Ok(())
            }
        };
        let cfg = config().shutdown_timeout(Duration::from_millis(500));
        let server = Arc::new(HsHaServer::new(processor, cfg).unwrap());
        let (addr, join) = run(&server);

        let mut c = connect(addr);
        write_frame(&mut c, b"never finishes").unwrap();
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        server.stop();
        join.join().unwrap().unwrap();
        let elapsed = start.elapsed();
        release.store(true, Ordering::SeqCst);

        assert!(elapsed >= Duration::from_millis(490), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1200), "{:?}", elapsed);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    fn slow_flag_task(done: &Arc<AtomicBool>) -> hsha_core::pool::Task {
        let done = Arc::clone(done);
        Box::new(move || {
            thread::sleep(Duration::from_millis(200));
            done.store(true, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_selector_panic_still_drains_pool_and_stops() {
        let server = HsHaServer::new(echo, config()).unwrap();
        assert!(server.state.advance(ServerState::NotStarted, ServerState::Listening));
        let pool = ElasticPool::from_server_config(server.config()).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        pool.submit(slow_flag_task(&done)).unwrap();

        let dead = thread::Builder::new()
            .name("hsha-selector".into())
            .spawn(|| -> (Selector, Result<()>) { panic!("selector died") })
            .unwrap();
        let (selector, outcome) = server.join_selector(dead);
        assert!(selector.is_none());
        assert!(outcome.is_ok());

        server.shut_down(&pool, selector, outcome).unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(pool.is_terminated());
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_selector_failure_drains_pool_then_is_returned() {
        let server = HsHaServer::new(echo, config()).unwrap();
        assert!(server.state.advance(ServerState::NotStarted, ServerState::Listening));
        let pool = Arc::new(ElasticPool::from_server_config(server.config()).unwrap());
        let selector = server.start_listening(&pool).unwrap();
        let addr = server.local_addr().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        pool.submit(slow_flag_task(&done)).unwrap();

        let failed = thread::spawn(move || {
            let err = io::Error::new(io::ErrorKind::Other, "epoll_wait failed");
            (selector, Err(HshaError::Io(err)))
        });
        let (selector, outcome) = server.join_selector(failed);
        assert!(selector.is_some());

        let err = server.shut_down(&*pool, selector, outcome).unwrap_err();
        assert!(matches!(err, HshaError::Io(_)));
        assert!(done.load(Ordering::SeqCst));
        assert!(pool.is_terminated());
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_saturated_pool_rejects_and_counts() {
        let processor = |req: &[u8], resp: &mut Vec<u8>| -> Result<()> {
            thread::sleep(Duration::from_millis(400));
            resp.extend_from_slice(req);
            Ok(())
        };
        let cfg = config().min_worker_threads(1).max_worker_threads(1).max_queued(1);
        let server = Arc::new(HsHaServer::new(processor, cfg).unwrap());
        let (addr, join) = run(&server);

        // First runs, second waits in the queue, third finds it full.
        let mut running = connect(addr);
        write_frame(&mut running, b"running").unwrap();
        thread::sleep(Duration::from_millis(100));
        let mut queued = connect(addr);
        write_frame(&mut queued, b"queued").unwrap();
        thread::sleep(Duration::from_millis(100));
        let mut refused = connect(addr);
        write_frame(&mut refused, b"refused").unwrap();

        assert!(read_frame(&mut refused).is_err());
        assert_eq!(read_frame(&mut running).unwrap(), b"running");
        assert_eq!(read_frame(&mut queued).unwrap(), b"queued");
        assert_eq!(server.rejected(), 1);
        assert_eq!(server.dispatched(), 2);

        server.stop();
        join.join().unwrap().unwrap();
    }
}
