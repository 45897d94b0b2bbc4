//! Leveled stderr logging for the selector and worker threads.
//!
//! Every line carries the level and the emitting thread's name, so
//! selector output (`hsha-selector`) and worker output (`hsha-worker-N`)
//! can be told apart in an interleaved log.
//!
//! # Environment Variables
//!
//! - `HSHA_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace or 0-5 (default: info)
//! - `HSHA_LOG_FLUSH=1` - flush stderr after each line
//!
//! # Usage
//!
//! ```ignore
//! use hsha_core::{log_info, log_warn};
//!
//! log_info!("listening on {}", addr);
//! log_warn!("abandoning {} workers", n);
//! ```

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

/// Severity threshold. A line is emitted when its level is at or below
/// the global threshold; `Off` silences everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        Self::Off,
        Self::Error,
        Self::Warn,
        Self::Info,
        Self::Debug,
        Self::Trace,
    ];

    /// Out-of-range values saturate to `Trace`.
    pub fn from_u8(v: u8) -> Self {
        Self::ALL[usize::from(v).min(Self::ALL.len() - 1)]
    }

    /// Accepts a level name (any case) or its number.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return (usize::from(n) < Self::ALL.len()).then(|| Self::from_u8(n));
        }
        Self::ALL.into_iter().find(|l| l.name().eq_ignore_ascii_case(s))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INIT: Once = Once::new();

/// Read `HSHA_LOG_LEVEL` / `HSHA_LOG_FLUSH`.
///
/// Runs once; called implicitly by the first log line. Levels set with
/// `set_log_level` before that point are overwritten only if the env
/// var is present.
pub fn init() {
    INIT.call_once(|| {
        if let Some(level) = std::env::var("HSHA_LOG_LEVEL").ok().and_then(|v| LogLevel::parse(&v)) {
            LOG_LEVEL.store(level as u8, Ordering::Relaxed);
        }
        if crate::env::env_get_bool("HSHA_LOG_FLUSH", false) {
            FLUSH_ENABLED.store(true, Ordering::Relaxed);
        }
    });
}

/// Current threshold.
pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Override the threshold for the whole process.
pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    match level {
        LogLevel::Off => false,
        _ => level <= log_level(),
    }
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let thread = std::thread::current();
    let mut out = io::stderr().lock();
    let _ = writeln!(
        out,
        "{:<5} [{}] {}",
        level.name().to_ascii_uppercase(),
        thread.name().unwrap_or("-"),
        args
    );
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

/// Log at an explicit level. The level-named macros below forward here.
#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        $crate::log::_log_impl($level, ::core::format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => { $crate::log_at!($crate::log::LogLevel::Error, $($arg)+) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => { $crate::log_at!($crate::log::LogLevel::Warn, $($arg)+) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => { $crate::log_at!($crate::log::LogLevel::Info, $($arg)+) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)+) => { $crate::log_at!($crate::log::LogLevel::Debug, $($arg)+) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)+) => { $crate::log_at!($crate::log::LogLevel::Trace, $($arg)+) };
}
