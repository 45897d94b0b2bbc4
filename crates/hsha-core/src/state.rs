//! Coarse server lifecycle state.
//!
//! ```text
//! NotStarted ──serve()──▶ Listening ──selector exits──▶ ShuttingDown ──pool drained──▶ Stopped
//!                             │                                                           ▲
//!                             └────────── bind / pool start failure ──────────────────────┘
//! ```
//!
//! Transitions only move forward. There is no restart.

use core::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServerState {
    NotStarted = 0,
    Listening = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl ServerState {
    /// Whether `self → next` is a legal transition.
    #[inline]
    pub const fn can_advance_to(&self, next: ServerState) -> bool {
        matches!(
            (self, next),
            (ServerState::NotStarted, ServerState::Listening)
                | (ServerState::Listening, ServerState::ShuttingDown)
                | (ServerState::Listening, ServerState::Stopped)
                | (ServerState::ShuttingDown, ServerState::Stopped)
        )
    }

    #[inline]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, ServerState::Stopped)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::NotStarted => "not-started",
            ServerState::Listening => "listening",
            ServerState::ShuttingDown => "shutting-down",
            ServerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Single-writer state holder that other threads can read or wait on.
pub struct StateCell {
    state: Mutex<ServerState>,
    changed: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::NotStarted),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        // State is a plain Copy enum; a poisoned lock still holds a valid value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> ServerState {
        *self.lock()
    }

    /// Move from `from` to `to`. Returns `false` (and changes nothing)
    /// if the current state is not `from` or the transition is illegal.
    pub fn advance(&self, from: ServerState, to: ServerState) -> bool {
        let mut guard = self.lock();
        if *guard != from || !from.can_advance_to(to) {
            return false;
        }
        *guard = to;
        drop(guard);
        self.changed.notify_all();
        true
    }

    /// Wake `wait_for` callers without a transition, after something
    /// their predicate reads has changed.
    pub fn notify_waiters(&self) {
        let _guard = self.lock();
        self.changed.notify_all();
    }

    /// Block until `pred(state)` holds or `timeout` elapses.
    /// Returns the last observed state.
    pub fn wait_for<F>(&self, mut pred: F, timeout: Duration) -> ServerState
    where
        F: FnMut(ServerState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if pred(*guard) {
                return *guard;
            }
            let now = Instant::now();
            if now >= deadline {
                return *guard;
            }
            guard = match self.changed.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }
}
