//! Application handler seam.

use crate::error::Result;

/// The business logic invoked once per request frame.
///
/// Runs on a worker thread and may block. `response` arrives empty;
/// whatever is written to it becomes the response frame payload.
/// Returning `Err` closes the connection.
pub trait Processor: Send + Sync + 'static {
    fn process(&self, request: &[u8], response: &mut Vec<u8>) -> Result<()>;
}

impl<F> Processor for F
where
    F: Fn(&[u8], &mut Vec<u8>) -> Result<()> + Send + Sync + 'static,
{
    fn process(&self, request: &[u8], response: &mut Vec<u8>) -> Result<()> {
        self(request, response)
    }
}
