//! HsHa Echo Server
//!
//! Echoes every length-prefixed frame back on the same connection.
//! Handlers run on the elastic worker pool, so an artificial delay
//! shows the pool growing toward its maximum under load.
//!
//! Usage:
//!     cargo build --release -p hsha-echo
//!     ./target/release/hsha-echo [port]
//!
//! Environment:
//!     HSHA_PORT, HSHA_MIN_WORKERS, HSHA_MAX_WORKERS, ...   server config
//!     HSHA_ECHO_DELAY_MS                                    per-request sleep
//!     HSHA_LOG_LEVEL=debug                                  verbose logging
//!
//! Ctrl-C (or SIGTERM) stops accepting, drains the pool, and exits.

use hsha_core::{env_get, log_error, log_info};
use hsha_server::{HsHaServer, Result, ServerConfig};

use nix::sys::signal::{SigSet, Signal};

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::from_env();
    if let Some(port) = args.get(1).and_then(|s| s.parse().ok()) {
        config = config.port(port);
    }
    let delay = Duration::from_millis(env_get("HSHA_ECHO_DELAY_MS", 0u64));

    // Block before any thread exists so every thread inherits the mask
    // and only the waiter below sees the signals.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    if let Err(e) = signals.thread_block() {
        log_error!("failed to block signals: {}", e);
        return ExitCode::FAILURE;
    }

    let processor = move |req: &[u8], resp: &mut Vec<u8>| -> Result<()> {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        resp.extend_from_slice(req);
        Ok(())
    };

    let server = match HsHaServer::new(processor, config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log_error!("hsha-echo: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let s = Arc::clone(&server);
    let spawned = thread::Builder::new()
        .name("hsha-signals".into())
        .spawn(move || match signals.wait() {
            Ok(sig) => {
                log_info!("received {:?}, shutting down", sig);
                s.stop();
            }
            Err(e) => log_error!("sigwait failed: {}", e),
        });
    if let Err(e) = spawned {
        log_error!("failed to spawn signal thread: {}", e);
        return ExitCode::FAILURE;
    }

    let cfg = server.config();
    log_info!(
        "hsha-echo: port {} workers {}..{} delay {:?}",
        cfg.port,
        cfg.min_worker_threads,
        cfg.max_worker_threads,
        delay
    );

    match server.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_error!("hsha-echo: {}", e);
            ExitCode::FAILURE
        }
    }
}
