//! `ElasticPool`: default `WorkerPool` implementation.
//!
//! Starts `min` OS threads up front and grows towards `max` when a task
//! arrives and no worker is idle. Workers above `min` that stay idle for
//! `keep_alive` exit. Tasks travel through a lock-free MPMC `SegQueue`;
//! the mutex only guards the worker counters and the park/unpark
//! handshake.
//!
//! ```text
//! submit() ──▶ idle worker?  ── yes ─▶ claim it (idle -= 1, wakeups += 1), notify_one
//!                  │ no
//!                  ▼
//!             total < max?   ── yes ─▶ spawn hsha-worker-N
//!                  │ no
//!                  ▼
//!             task waits in queue for the next free worker
//! ```

use hsha_core::config::{defaults, ServerConfig};
use hsha_core::error::{panic_message, HshaError, Result};
use hsha_core::pool::{PoolStats, Task, WorkerPool};
use hsha_core::{log_debug, log_error, log_trace, log_warn};

use crossbeam_queue::SegQueue;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ElasticPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Idle time after which a worker above `min_workers` exits.
    pub keep_alive: Duration,
    /// Queue bound; 0 means unbounded.
    pub max_queued: usize,
    /// Thread name prefix; workers are named `<prefix>-<n>`.
    pub name: String,
}

impl Default for ElasticPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: defaults::MIN_WORKER_THREADS,
            max_workers: defaults::MAX_WORKER_THREADS,
            keep_alive: Duration::from_millis(defaults::KEEP_ALIVE_MS),
            max_queued: defaults::MAX_QUEUED,
            name: "hsha-worker".to_string(),
        }
    }
}

impl From<&ServerConfig> for ElasticPoolConfig {
    fn from(c: &ServerConfig) -> Self {
        Self {
            min_workers: c.min_worker_threads,
            max_workers: c.max_worker_threads,
            keep_alive: c.keep_alive,
            max_queued: c.max_queued,
            ..Self::default()
        }
    }
}

/// Counters guarded by the pool mutex.
struct PoolState {
    /// Live worker threads.
    total: usize,
    /// Workers parked on `work_ready` and not yet claimed.
    idle: usize,
    /// Claims handed out by `submit()` that no worker has consumed yet.
    wakeups: usize,
    largest: usize,
    shutdown: bool,
    next_id: usize,
}

/// Shared state between submitters and workers.
struct PoolInner {
    config: ElasticPoolConfig,
    queue: SegQueue<Task>,
    state: Mutex<PoolState>,
    /// Idle workers park here.
    work_ready: Condvar,
    /// `await_termination()` parks here.
    terminated: Condvar,
    /// Lock-free mirror of `PoolState::shutdown`.
    shutdown_flag: AtomicBool,
    active: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Tasks never run under this lock, so poisoning would only come
        // from a bug in the bookkeeping itself; the counters stay usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(&self, task: Task) {
        self.active.fetch_add(1, Ordering::Relaxed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(task));
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);

        if let Err(payload) = outcome {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            log_error!("task panicked, worker recycled: {}", panic_message(&*payload));
        }
    }
}

pub struct ElasticPool {
    inner: Arc<PoolInner>,
}

impl ElasticPool {
    /// Create a pool and start `min_workers` threads.
    pub fn new(config: ElasticPoolConfig) -> Result<Self> {
        if config.min_workers == 0 {
            return Err(HshaError::InvalidConfig("min_workers must be at least 1"));
        }
        if config.max_workers < config.min_workers {
            return Err(HshaError::InvalidConfig("max_workers must be >= min_workers"));
        }

        let inner = Arc::new(PoolInner {
            config,
            queue: SegQueue::new(),
            state: Mutex::new(PoolState {
                total: 0,
                idle: 0,
                wakeups: 0,
                largest: 0,
                shutdown: false,
                next_id: 0,
            }),
            work_ready: Condvar::new(),
            terminated: Condvar::new(),
            shutdown_flag: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });
        let pool = ElasticPool { inner };

        {
            let mut st = pool.inner.lock();
            for _ in 0..pool.inner.config.min_workers {
                if let Err(e) = spawn_worker(&pool.inner, &mut st) {
                    drop(st);
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        log_debug!(
            "{}: pool started min={} max={} keep_alive={:?}",
            pool.inner.config.name,
            pool.inner.config.min_workers,
            pool.inner.config.max_workers,
            pool.inner.config.keep_alive
        );
        Ok(pool)
    }

    pub fn from_server_config(config: &ServerConfig) -> Result<Self> {
        Self::new(ElasticPoolConfig::from(config))
    }
}

impl WorkerPool for ElasticPool {
    fn submit(&self, task: Task) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.lock();
        if st.shutdown {
            return Err(HshaError::PoolShutdown);
        }
        let max_queued = inner.config.max_queued;
        if max_queued > 0 && inner.queue.len() >= max_queued {
            return Err(HshaError::PoolSaturated);
        }

        if st.idle > 0 {
            st.idle -= 1;
            st.wakeups += 1;
            inner.work_ready.notify_one();
        } else if st.total < inner.config.max_workers {
            if let Err(e) = spawn_worker(inner, &mut st) {
                if st.total == 0 {
                    return Err(e);
                }
                log_warn!(
                    "{}: could not grow pool past {} workers: {}",
                    inner.config.name,
                    st.total,
                    e
                );
            }
        }

        // Pushed under the lock: a worker that re-checks the queue while
        // holding it cannot miss this task and then park.
        inner.queue.push(task);
        Ok(())
    }

    /// Also wakes every `await_termination()` caller, which re-checks
    /// its own deadline and goes back to waiting.
    fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut st = inner.lock();
            if !st.shutdown {
                st.shutdown = true;
                inner.shutdown_flag.store(true, Ordering::Release);
                log_debug!(
                    "{}: shutdown requested, {} queued, {} running",
                    inner.config.name,
                    inner.queue.len(),
                    inner.active.load(Ordering::Relaxed)
                );
            }
        }
        inner.work_ready.notify_all();
        inner.terminated.notify_all();
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        // Absolute deadline: an early wake never restarts the budget.
        let deadline = Instant::now().checked_add(timeout);
        let mut st = inner.lock();
        loop {
            if st.shutdown && st.total == 0 {
                return true;
            }
            st = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match inner.terminated.wait_timeout(st, deadline - now) {
                        Ok((g, _)) => g,
                        Err(e) => e.into_inner().0,
                    }
                }
                None => match inner.terminated.wait(st) {
                    Ok(g) => g,
                    Err(e) => e.into_inner(),
                },
            };
        }
    }

    fn is_shutdown(&self) -> bool {
        self.inner.shutdown_flag.load(Ordering::Acquire)
    }

    fn is_terminated(&self) -> bool {
        let st = self.inner.lock();
        st.shutdown && st.total == 0
    }

    fn min_workers(&self) -> usize {
        self.inner.config.min_workers
    }

    fn max_workers(&self) -> usize {
        self.inner.config.max_workers
    }

    fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let st = inner.lock();
        PoolStats {
            total: st.total,
            idle: st.idle,
            active: inner.active.load(Ordering::Relaxed),
            queued: inner.queue.len(),
            largest: st.largest,
            completed: inner.completed.load(Ordering::Relaxed),
            panicked: inner.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ElasticPool {
    fn drop(&mut self) {
        // Workers drain the queue and exit on their own. No join here:
        // a stuck task must not hang whoever drops the pool.
        self.shutdown();
    }
}

/// Spawn one worker. Caller holds the pool lock.
fn spawn_worker(inner: &Arc<PoolInner>, st: &mut PoolState) -> Result<()> {
    let id = st.next_id;
    st.next_id += 1;
    let worker_inner = Arc::clone(inner);
    thread::Builder::new()
        .name(format!("{}-{}", inner.config.name, id))
        .spawn(move || worker_loop(worker_inner))
        .map_err(HshaError::Spawn)?;
    st.total += 1;
    st.largest = st.largest.max(st.total);
    Ok(())
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>) {
    log_trace!("worker started");
    loop {
        if let Some(task) = inner.queue.pop() {
            inner.run(task);
            continue;
        }

        let mut st = inner.lock();
        if !inner.queue.is_empty() {
            continue;
        }
        if st.shutdown {
            st.total -= 1;
            let last = st.total == 0;
            drop(st);
            if last {
                inner.terminated.notify_all();
            }
            log_trace!("worker exiting on shutdown");
            return;
        }

        st.idle += 1;
        // Core workers park until woken; only workers above `min` carry
        // the keep-alive deadline that lets them retire.
        let timed_out;
        if st.total > inner.config.min_workers {
            let (guard, wait) = match inner.work_ready.wait_timeout(st, inner.config.keep_alive) {
                Ok(r) => r,
                Err(e) => e.into_inner(),
            };
            st = guard;
            timed_out = wait.timed_out();
        } else {
            st = match inner.work_ready.wait(st) {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
            timed_out = false;
        }

        if st.wakeups > 0 {
            // Claimed by submit(); our idle slot was already released.
            st.wakeups -= 1;
            continue;
        }
        st.idle -= 1;

        if timed_out
            && !st.shutdown
            && st.total > inner.config.min_workers
            && inner.queue.is_empty()
        {
            st.total -= 1;
            log_trace!("worker idle for {:?}, retiring", inner.config.keep_alive);
            return;
        }
    }
}
