//! Module that contains the logging helpers used across the crate.
//!
//! Messages are formatted at the call site (usually with `cformat!`) and
//! forwarded to `tracing`, so any subscriber can pick them up.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "ricart_mutex=info";

/// Function that installs the default `tracing` subscriber.
///
/// Honors `RUST_LOG` and does nothing if a global subscriber is already set.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Function that logs an informational message.
pub fn info(msg: &str) {
    tracing::info!("{msg}");
}

/// Function that logs a warning.
pub fn warn(msg: &str) {
    tracing::warn!("{msg}");
}

/// Function that logs an error.
pub fn error(msg: &str) {
    tracing::error!("{msg}");
}

/// Function that logs a debug message.
pub fn debug(msg: &str) {
    tracing::debug!("{msg}");
}
