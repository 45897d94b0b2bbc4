//! Frame unit abstraction.
//!
//! A frame unit is one fully-buffered request/response cycle on one
//! connection. The selector builds it once a complete request frame has
//! been read and hands it to a `FrameDispatch`. Whoever ends up holding
//! it calls `invoke()` exactly once, on a worker thread.

/// Identifies a connection slot inside the selector.
///
/// Low 32 bits are the slot index, high 32 bits a generation counter
/// that is bumped every time the slot is reused, so a late completion
/// for a closed connection never lands on its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ConnToken(pub u64);

impl ConnToken {
    #[inline]
    pub fn new(slot: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    #[inline]
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// One request/response cycle, ready to run.
///
/// **Contract:**
/// - `invoke()` consumes the unit, so it runs at most once.
/// - It runs the handler synchronously on the calling thread and leaves
///   the response for the selector to write. It never touches socket
///   state directly.
/// - A unit dropped without being invoked must release its connection
///   (the selector closes it) rather than leave it pending forever.
pub trait FrameUnit: Send + 'static {
    /// Run the handler against the buffered request.
    fn invoke(self: Box<Self>);

    /// The connection this frame belongs to.
    fn token(&self) -> ConnToken;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip_fields() {
        let t = ConnToken::new(7, 3);
        assert_eq!(t.slot(), 7);
        assert_eq!(t.generation(), 3);
    }

    #[test]
    fn test_token_generation_distinguishes_reuse() {
        assert_ne!(ConnToken::new(1, 0), ConnToken::new(1, 1));
    }
}
