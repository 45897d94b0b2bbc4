//! # hsha-server: Half-sync/half-async server
//!
//! A single selector thread owns every socket and assembles request
//! frames; complete frames are handed to an elastic pool of worker
//! threads that run the processor. Slow handlers block a worker, never
//! the selector.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  serve() caller thread (control)                          │
//! │    start pool → bind → spawn selector → join → drain pool │
//! └──────────────────────────┬────────────────────────────────┘
//!                            │
//! ┌──────────────────────────▼────────────────────────────────┐
//! │  hsha-selector thread                                     │
//! │    epoll: accept / read frame / write response            │
//! │    complete frame → Invoker::dispatch() → pool.submit()   │
//! └──────────────────────────┬────────────────────────────────┘
//!                            │ Invocation
//! ┌──────────────────────────▼────────────────────────────────┐
//! │  hsha-worker-N threads (min..max)                         │
//! │    Invocation::run() → FrameUnit::invoke() → Processor    │
//! │    response → completion queue → eventfd wakes selector   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use hsha_server::{HsHaServer, ServerConfig};
//! use std::sync::Arc;
//!
//! let config = ServerConfig::from_env().port(9090);
//! let server = Arc::new(HsHaServer::new(
//!     |req: &[u8], resp: &mut Vec<u8>| { resp.extend_from_slice(req); Ok(()) },
//!     config,
//! )?);
//!
//! let s = Arc::clone(&server);
//! std::thread::spawn(move || s.serve());
//! // ...
//! server.stop();
//! ```

pub mod invoker;
pub mod server;
pub mod background;

pub use background::BackgroundServer;
pub use invoker::{Invocation, Invoker};
pub use server::HsHaServer;

pub use hsha_core::{HshaError, Processor, Result, ServerConfig, ServerState};
