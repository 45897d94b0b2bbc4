//! `BackgroundServer`: runs `serve()` on its own thread.
//!
//! For embedding and tests: `start()` returns once the spawn succeeded,
//! `wait_listening()` gives the bound address, and dropping the handle
//! stops the server and joins the thread.

use hsha_core::config::ServerConfig;
use hsha_core::error::{HshaError, Result};
use hsha_core::processor::Processor;
use hsha_core::state::ServerState;
use hsha_core::log_warn;

use crate::server::HsHaServer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct BackgroundServer {
    server: Arc<HsHaServer>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl BackgroundServer {
    pub fn start<P: Processor>(processor: P, config: ServerConfig) -> Result<Self> {
        Self::spawn(Arc::new(HsHaServer::new(processor, config)?))
    }

    pub fn spawn(server: Arc<HsHaServer>) -> Result<Self> {
        let s = Arc::clone(&server);
        let thread = thread::Builder::new()
            .name("hsha-serve".into())
            .spawn(move || {
                let outcome = s.serve();
                if let Err(ref e) = outcome {
                    log_warn!("background server exited with error: {}", e);
                }
                outcome
            })
            .map_err(HshaError::Spawn)?;

        Ok(Self { server, thread: Some(thread) })
    }

    pub fn server(&self) -> &Arc<HsHaServer> {
        &self.server
    }

    pub fn state(&self) -> ServerState {
        self.server.state()
    }

    pub fn wait_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        self.server.wait_listening(timeout)
    }

    /// Request stop without waiting.
    pub fn stop(&self) {
        self.server.stop();
    }

    /// Block until `serve()` returns and hand back its result.
    pub fn join(mut self) -> Result<()> {
        self.join_inner()
    }

    /// `stop()` followed by `join()`.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join()
    }

    fn join_inner(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(t) => t.join().unwrap_or_else(|payload| Err(HshaError::from_panic(&*payload))),
            None => Ok(()),
        }
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.server.stop();
            let _ = self.join_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsha_module::framed::{read_frame, write_frame};
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    fn config() -> ServerConfig {
        ServerConfig::new()
            .loopback_ephemeral()
            .min_worker_threads(1)
            .max_worker_threads(2)
            .shutdown_timeout(Duration::from_secs(1))
    }

    fn upper(req: &[u8], resp: &mut Vec<u8>) -> Result<()> {
        resp.extend(req.iter().map(|b| b.to_ascii_uppercase()));
        Ok(())
    }

    #[test]
    fn test_start_serve_shutdown() {
        let bg = BackgroundServer::start(upper, config()).unwrap();
        let addr = bg.wait_listening(Duration::from_secs(5)).unwrap();
        assert_eq!(bg.state(), ServerState::Listening);

        let mut s = TcpStream::connect(addr).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write_frame(&mut s, b"hello").unwrap();
        assert_eq!(read_frame(&mut s).unwrap(), b"HELLO");

        let server = Arc::clone(bg.server());
        bg.shutdown().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_stop_does_not_block() {
        let bg = BackgroundServer::start(upper, config()).unwrap();
        bg.wait_listening(Duration::from_secs(5)).unwrap();

        let start = Instant::now();
        bg.stop();
        assert!(start.elapsed() < Duration::from_millis(100));
        bg.join().unwrap();
    }

    #[test]
    fn test_join_reports_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let bg = BackgroundServer::start(upper, config().port(port)).unwrap();

        assert!(bg.wait_listening(Duration::from_secs(5)).is_none());
        assert!(matches!(bg.join(), Err(HshaError::Bind(_))));
    }

    #[test]
    fn test_join_reports_serve_thread_panic() {
        let server = Arc::new(HsHaServer::new(upper, config()).unwrap());
        let thread = thread::Builder::new()
            .name("hsha-serve".into())
            .spawn(|| -> Result<()> { panic!("serve blew up") })
            .unwrap();
        let bg = BackgroundServer { server, thread: Some(thread) };

        match bg.join() {
            Err(HshaError::Panicked(msg)) => assert_eq!(msg, "serve blew up"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_drop_stops_server() {
        let bg = BackgroundServer::start(upper, config()).unwrap();
        bg.wait_listening(Duration::from_secs(5)).unwrap();
        let server = Arc::clone(bg.server());

        drop(bg);
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
