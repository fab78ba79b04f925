//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; applications call [`init`] once
//! at startup. `RUST_LOG` overrides the default filter.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output for development.
    #[default]
    Pretty,
    /// One JSON object per line for log shippers.
    Json,
}

/// Failed to install the global subscriber.
#[derive(Error, Debug)]
#[error("Failed to initialize logging: {0}")]
pub struct LoggingError(String);

/// Install the global tracing subscriber.
///
/// `default_filter` (e.g. `"info,courier_runtime=debug"`) applies when
/// `RUST_LOG` is unset or invalid.
///
/// # Errors
///
/// Returns [`LoggingError`] if a global subscriber is already installed.
pub fn init(format: LogFormat, default_filter: &str) -> Result<(), LoggingError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| LoggingError(e.to_string()))
}
