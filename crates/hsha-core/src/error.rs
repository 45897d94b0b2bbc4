//! HsHa error types.

use std::any::Any;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum HshaError {
    /// Configuration rejected by `ServerConfig::validate()`.
    InvalidConfig(&'static str),
    /// Listening socket could not be bound.
    Bind(io::Error),
    /// I/O error on an open socket or descriptor.
    Io(io::Error),
    /// OS error with errno.
    Os(i32),
    /// A worker or selector thread could not be spawned.
    Spawn(io::Error),
    /// Pool is shutting down and rejects new tasks.
    PoolShutdown,
    /// Pool queue bound reached.
    PoolSaturated,
    /// `serve()` called on a server that already ran.
    AlreadyStarted,
    /// Incoming frame length exceeds the configured maximum.
    FrameTooLarge(usize),
    /// The processor failed a request.
    Handler(String),
    /// A server-owned thread (selector or serve thread) panicked.
    Panicked(String),
}

impl fmt::Display for HshaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::Bind(e) => write!(f, "bind failed: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::Spawn(e) => write!(f, "thread spawn failed: {}", e),
            Self::PoolShutdown => write!(f, "worker pool is shut down"),
            Self::PoolSaturated => write!(f, "worker pool queue is full"),
            Self::AlreadyStarted => write!(f, "server already started"),
            Self::FrameTooLarge(n) => write!(f, "frame of {} bytes exceeds limit", n),
            Self::Handler(msg) => write!(f, "handler error: {}", msg),
            Self::Panicked(msg) => write!(f, "thread panicked: {}", msg),
        }
    }
}

impl std::error::Error for HshaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(e) | Self::Io(e) | Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HshaError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl HshaError {
    /// Build an `Os` error from the calling thread's errno.
    pub fn last_os_error() -> Self {
        Self::Os(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Wrap the payload of a joined thread that panicked.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked(panic_message(payload).to_owned())
    }
}

/// Text of a panic payload from `catch_unwind` or `JoinHandle::join`.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

pub type Result<T> = std::result::Result<T, HshaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display() {
        assert_eq!(HshaError::PoolShutdown.to_string(), "worker pool is shut down");
        assert_eq!(
            HshaError::InvalidConfig("min_worker_threads must be at least 1").to_string(),
            "invalid config: min_worker_threads must be at least 1"
        );
        assert_eq!(HshaError::FrameTooLarge(42).to_string(), "frame of 42 bytes exceeds limit");
    }

    #[test]
    fn test_from_panic_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("selector died")).unwrap_err();
        let err = HshaError::from_panic(&*payload);
        assert!(matches!(err, HshaError::Panicked(ref m) if m == "selector died"));
        assert_eq!(err.to_string(), "thread panicked: selector died");

        let payload = std::panic::catch_unwind(|| panic!("slot {}", 3)).unwrap_err();
        assert_eq!(panic_message(&*payload), "slot 3");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u32)).unwrap_err();
        assert_eq!(panic_message(&*payload), "<non-string panic payload>");
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let err: HshaError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, HshaError::Io(_)));
        assert!(err.source().is_some());
        assert!(HshaError::PoolSaturated.source().is_none());
    }
}
