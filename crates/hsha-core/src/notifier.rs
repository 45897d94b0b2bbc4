//! Selector wake-up abstraction.
//!
//! A `Notifier` wakes the selector thread out of its multiplex wait,
//! either because a worker buffered a response or because `stop()` was
//! requested.
//!
//! # Implementors
//!
//! - `EventFdNotifier` (default, Linux): writes 1 to an eventfd that
//!   sits in the selector's epoll set.

use crate::error::Result;

/// Wakes the selector.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the selector wakes are coalesced.
pub trait Notifier: Send + Sync {
    fn notify(&self) -> Result<()>;
}
