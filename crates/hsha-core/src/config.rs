//! Server configuration.
//!
//! Built once, validated, then handed to the server by value. Nothing
//! mutates it after `serve()` starts.
//!
//! # Example
//!
//! ```rust,ignore
//! use hsha_core::ServerConfig;
//!
//! // Library defaults with env overrides
//! let config = ServerConfig::from_env();
//!
//! // Or explicitly
//! let config = ServerConfig::new()
//!     .port(9090)
//!     .min_worker_threads(2)
//!     .max_worker_threads(4)
//!     .shutdown_timeout(Duration::from_secs(2));
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::env::env_get;
use crate::error::{HshaError, Result};

pub mod defaults {
    use std::net::{IpAddr, Ipv4Addr};

    pub const BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    pub const PORT: u16 = 9090;
    pub const MIN_WORKER_THREADS: usize = 5;
    /// Effectively unbounded.
    pub const MAX_WORKER_THREADS: usize = usize::MAX;
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 60_000;
    pub const KEEP_ALIVE_MS: u64 = 60_000;
    /// 0 = unbounded queue.
    pub const MAX_QUEUED: usize = 0;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    pub const MAX_CONNECTIONS: usize = 65_536;
    pub const POLL_TIMEOUT_MS: u64 = 100;
    pub const MAX_EVENTS: usize = 1024;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listening socket binds to.
    pub bind_addr: IpAddr,
    /// Listening port. 0 picks an ephemeral port.
    pub port: u16,
    /// Workers kept alive even when idle. Must be at least 1.
    pub min_worker_threads: usize,
    /// Upper bound on worker threads. Must be >= `min_worker_threads`.
    pub max_worker_threads: usize,
    /// Budget for draining the pool once the selector stops.
    pub shutdown_timeout: Duration,
    /// Idle time after which a worker above `min_worker_threads` exits.
    pub keep_alive: Duration,
    /// Queue bound; 0 means unbounded.
    pub max_queued: usize,
    /// Largest accepted request frame, in bytes.
    pub max_frame_size: usize,
    /// Open connections beyond this are refused.
    pub max_connections: usize,
    /// Upper bound on one multiplex wait, so the selector sees `stop()`.
    pub poll_timeout: Duration,
    /// Readiness events drained per multiplex wait.
    pub max_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Library defaults, no env override.
    pub fn new() -> Self {
        Self {
            bind_addr: defaults::BIND_ADDR,
            port: defaults::PORT,
            min_worker_threads: defaults::MIN_WORKER_THREADS,
            max_worker_threads: defaults::MAX_WORKER_THREADS,
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            keep_alive: Duration::from_millis(defaults::KEEP_ALIVE_MS),
            max_queued: defaults::MAX_QUEUED,
            max_frame_size: defaults::MAX_FRAME_SIZE,
            max_connections: defaults::MAX_CONNECTIONS,
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            max_events: defaults::MAX_EVENTS,
        }
    }

    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `HSHA_BIND_ADDR` - IP to bind
    /// - `HSHA_PORT` - listening port
    /// - `HSHA_MIN_WORKERS` / `HSHA_MAX_WORKERS` - worker bounds
    /// - `HSHA_SHUTDOWN_TIMEOUT_MS` - pool drain budget
    /// - `HSHA_KEEP_ALIVE_MS` - idle worker reap time
    /// - `HSHA_MAX_QUEUED` - queue bound (0 = unbounded)
    /// - `HSHA_MAX_FRAME_SIZE` - largest request frame
    /// - `HSHA_MAX_CONNECTIONS` - open connection limit
    /// - `HSHA_POLL_TIMEOUT_MS` - selector wait bound
    /// - `HSHA_MAX_EVENTS` - events per selector wait
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_get("HSHA_BIND_ADDR", defaults::BIND_ADDR),
            port: env_get("HSHA_PORT", defaults::PORT),
            min_worker_threads: env_get("HSHA_MIN_WORKERS", defaults::MIN_WORKER_THREADS),
            max_worker_threads: env_get("HSHA_MAX_WORKERS", defaults::MAX_WORKER_THREADS),
            shutdown_timeout: Duration::from_millis(env_get(
                "HSHA_SHUTDOWN_TIMEOUT_MS",
                defaults::SHUTDOWN_TIMEOUT_MS,
            )),
            keep_alive: Duration::from_millis(env_get(
                "HSHA_KEEP_ALIVE_MS",
                defaults::KEEP_ALIVE_MS,
            )),
            max_queued: env_get("HSHA_MAX_QUEUED", defaults::MAX_QUEUED),
            max_frame_size: env_get("HSHA_MAX_FRAME_SIZE", defaults::MAX_FRAME_SIZE),
            max_connections: env_get("HSHA_MAX_CONNECTIONS", defaults::MAX_CONNECTIONS),
            poll_timeout: Duration::from_millis(env_get(
                "HSHA_POLL_TIMEOUT_MS",
                defaults::POLL_TIMEOUT_MS,
            )),
            max_events: env_get("HSHA_MAX_EVENTS", defaults::MAX_EVENTS),
        }
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bind to 127.0.0.1 on an ephemeral port.
    pub fn loopback_ephemeral(self) -> Self {
        self.bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST)).port(0)
    }

    pub fn min_worker_threads(mut self, n: usize) -> Self {
        self.min_worker_threads = n;
        self
    }

    pub fn max_worker_threads(mut self, n: usize) -> Self {
        self.max_worker_threads = n;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn keep_alive(mut self, d: Duration) -> Self {
        self.keep_alive = d;
        self
    }

    pub fn max_queued(mut self, n: usize) -> Self {
        self.max_queued = n;
        self
    }

    pub fn max_frame_size(mut self, n: usize) -> Self {
        self.max_frame_size = n;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_worker_threads == 0 {
            return Err(HshaError::InvalidConfig("min_worker_threads must be at least 1"));
        }
        if self.max_worker_threads < self.min_worker_threads {
            return Err(HshaError::InvalidConfig(
                "max_worker_threads must be >= min_worker_threads",
            ));
        }
        if self.max_frame_size == 0 {
            return Err(HshaError::InvalidConfig("max_frame_size must be at least 1"));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(HshaError::InvalidConfig("max_frame_size must fit a 32-bit length prefix"));
        }
        if self.max_connections == 0 {
            return Err(HshaError::InvalidConfig("max_connections must be at least 1"));
        }
        if self.max_events == 0 {
            return Err(HshaError::InvalidConfig("max_events must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = ServerConfig::new();
        assert_eq!(c.min_worker_threads, 5);
        assert_eq!(c.max_worker_threads, usize::MAX);
        assert_eq!(c.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(c.max_queued, 0);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_min() {
        let c = ServerConfig::new().min_worker_threads(0);
        assert!(matches!(c.validate(), Err(HshaError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_max_below_min() {
        let c = ServerConfig::new().min_worker_threads(4).max_worker_threads(2);
        assert!(matches!(c.validate(), Err(HshaError::InvalidConfig(_))));
        assert!(ServerConfig::new().min_worker_threads(4).max_worker_threads(4).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(ServerConfig::new().max_frame_size(0).validate().is_err());
        assert!(ServerConfig::new().max_events(0).validate().is_err());
        assert!(ServerConfig::new().max_connections(0).validate().is_err());
    }

    #[test]
    fn test_loopback_ephemeral() {
        let c = ServerConfig::new().loopback_ephemeral();
        assert_eq!(c.socket_addr(), "127.0.0.1:0".parse().unwrap());
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("HSHA_MIN_WORKERS", "2");
        std::env::set_var("HSHA_MAX_WORKERS", "4");
        std::env::set_var("HSHA_SHUTDOWN_TIMEOUT_MS", "2000");
        std::env::set_var("HSHA_PORT", "not-a-port");
        let c = ServerConfig::from_env();
        std::env::remove_var("HSHA_MIN_WORKERS");
        std::env::remove_var("HSHA_MAX_WORKERS");
        std::env::remove_var("HSHA_SHUTDOWN_TIMEOUT_MS");
        std::env::remove_var("HSHA_PORT");

        assert_eq!(c.min_worker_threads, 2);
        assert_eq!(c.max_worker_threads, 4);
        assert_eq!(c.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(c.port, defaults::PORT);
    }
}
