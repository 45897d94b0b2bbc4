//! Worker pool abstraction (the synchronous half).
//!
//! A `WorkerPool` runs submitted tasks on its own OS threads. Tasks may
//! block for as long as they like; that is the reason the pool exists.
//!
//! # Implementors
//!
//! - `ElasticPool` (default): keeps `min` threads alive, grows to `max`
//!   on demand, reaps idle threads above `min`.

use std::time::Duration;

use crate::error::Result;

/// A unit of work. Runs exactly once, on a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Point-in-time pool counters. Values may be stale by the time they
/// are read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live worker threads.
    pub total: usize,
    /// Workers parked waiting for work.
    pub idle: usize,
    /// Workers currently running a task.
    pub active: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Highest `total` ever reached.
    pub largest: usize,
    /// Tasks that ran to completion (including ones that panicked).
    pub completed: u64,
    /// Tasks that panicked.
    pub panicked: u64,
}

/// Executes tasks on a bounded set of threads.
///
/// **Contract:**
/// - `submit()` must NEVER block the caller. A task it rejects is
///   dropped and the error returned.
/// - A panicking task must not kill its worker silently.
/// - After `shutdown()`, queued and running tasks still complete, new
///   ones are rejected.
pub trait WorkerPool: Send + Sync {
    /// Queue a task for execution.
    fn submit(&self, task: Task) -> Result<()>;

    /// Stop accepting tasks. Idempotent, non-blocking.
    fn shutdown(&self);

    /// Block until every worker has exited or `timeout` elapses.
    ///
    /// Returns `true` if the pool terminated. The total wait never
    /// exceeds `timeout`, however often the wait is woken early.
    fn await_termination(&self, timeout: Duration) -> bool;

    /// Whether `shutdown()` has been called.
    fn is_shutdown(&self) -> bool;

    /// Whether all workers have exited after shutdown.
    fn is_terminated(&self) -> bool;

    fn min_workers(&self) -> usize;

    fn max_workers(&self) -> usize;

    fn stats(&self) -> PoolStats;
}
