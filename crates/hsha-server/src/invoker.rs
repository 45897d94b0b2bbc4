//! Invocation dispatch: the hand-off from the selector to the pool.
//!
//! The selector calls `Invoker::dispatch()` for every complete frame.
//! The frame is wrapped in an `Invocation` and queued; the selector
//! thread never runs handler code.
//!
//! Submission failure policy: fail and close. A rejected invocation is
//! dropped, its frame unit releases the connection, and the error goes
//! back to the selector and into `rejected()`.

use hsha_core::dispatch::FrameDispatch;
use hsha_core::error::Result;
use hsha_core::frame::{ConnToken, FrameUnit};
use hsha_core::pool::WorkerPool;
use hsha_core::log_debug;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One frame, prepared to run on whichever worker picks it up.
pub struct Invocation {
    frame: Box<dyn FrameUnit>,
}

impl Invocation {
    pub fn new(frame: Box<dyn FrameUnit>) -> Self {
        Self { frame }
    }

    pub fn token(&self) -> ConnToken {
        self.frame.token()
    }

    pub fn run(self) {
        self.frame.invoke();
    }
}

/// `FrameDispatch` that queues every frame on a `WorkerPool`.
pub struct Invoker<P: WorkerPool + ?Sized> {
    pool: Arc<P>,
    dispatched: AtomicU64,
    rejected: AtomicU64,
}

impl<P: WorkerPool + ?Sized> Invoker<P> {
    pub fn new(pool: Arc<P>) -> Self {
        Self {
            pool,
            dispatched: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Frames accepted by the pool.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Frames the pool refused.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl<P: WorkerPool + ?Sized> FrameDispatch for Invoker<P> {
    fn dispatch(&self, frame: Box<dyn FrameUnit>) -> Result<()> {
        let invocation = Invocation::new(frame);
        let token = invocation.token();
        match self.pool.submit(Box::new(move || invocation.run())) {
            Ok(()) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log_debug!("pool refused invocation for {:?}: {}", token, e);
                Err(e)
            }
        }
    }
}
