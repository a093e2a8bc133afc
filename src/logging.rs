//! Logging configuration using tracing
//!
//! Structured logs go to stderr. `RUST_LOG` takes precedence over the level
//! named in the agent configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, SyncError};

/// Initialize the global tracing subscriber.
///
/// `level` is used when `RUST_LOG` is unset or unparsable, e.g. `"info"` or
/// `"cloudsync=debug"`.
///
/// # Errors
/// Returns an error if a subscriber has already been installed.
pub fn init(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init()
        .map_err(|e| SyncError::Config(format!("failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized).
pub fn init_test() {
    let _ = init("debug");
}
