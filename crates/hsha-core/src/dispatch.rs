//! Frame-ready callback.
//!
//! The selector calls `dispatch()` once per completed request frame
//! instead of invoking the frame itself. Implementations schedule the
//! frame; they must never run it on the calling thread.

use crate::error::Result;
use crate::frame::FrameUnit;

/// Receives frames from the selector thread.
///
/// **Contract:**
/// - `dispatch()` must NEVER block and never call `invoke()` itself.
/// - On `Err` the frame has been dropped; the selector closes the
///   connection.
pub trait FrameDispatch: Send + Sync {
    fn dispatch(&self, frame: Box<dyn FrameUnit>) -> Result<()>;
}
