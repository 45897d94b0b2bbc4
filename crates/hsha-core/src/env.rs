//! Environment variable helpers used by `ServerConfig::from_env()`.
//!
//! ```ignore
//! use hsha_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("HSHA_MIN_WORKERS", 5);
//! let flush = env_get_bool("HSHA_LOG_FLUSH", false);
//! ```

use std::str::FromStr;

/// `Some(T)` if `key` is set and its trimmed value parses.
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    raw.trim().parse().ok()
}

/// Parse `key` as `T`; unset or unparseable yields `default`.
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// `1`, `true`, `yes` and `on` (any case) read as true, anything else
/// as false. Unset yields `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map_or(default, |raw| {
        let raw = raw.trim();
        ["1", "true", "yes", "on"].iter().any(|t| raw.eq_ignore_ascii_case(t))
    })
}

pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}
