//! # hsha-core: Trait definitions for the half-sync/half-async server
//!
//! This crate defines the seams between the three moving parts of the
//! server:
//!
//! ```text
//!   Selector thread (async half)        Worker threads (sync half)
//!   ─────────────────────────────       ──────────────────────────
//!   accept / read / frame assembly
//!        │ FrameDispatch::dispatch()
//!        ▼
//!   WorkerPool::submit(task) ─────────▶ task() → FrameUnit::invoke()
//!                                              → Processor::process()
//!        ▲                                     │
//!        └──── Notifier::notify() ◀────────────┘ response buffered
//!   write response, re-arm read
//! ```
//!
//! Every component depends on traits from this crate, never on concrete
//! types. Default implementations live in `hsha-module`; the lifecycle
//! that wires them together lives in `hsha-server`.

pub mod frame;
pub mod processor;
pub mod dispatch;
pub mod pool;
pub mod notifier;
pub mod config;
pub mod state;
pub mod error;
pub mod log;
pub mod env;

pub use config::ServerConfig;
pub use dispatch::FrameDispatch;
pub use error::{panic_message, HshaError, Result};
pub use frame::{ConnToken, FrameUnit};
pub use notifier::Notifier;
pub use pool::{PoolStats, Task, WorkerPool};
pub use processor::Processor;
pub use state::{ServerState, StateCell};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
