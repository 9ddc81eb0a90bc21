//! Tracing subscriber setup for the binary
//!
//! `RUST_LOG` wins over the configured level when it is set.

use crate::error::{DaqError, DaqResult};
use tracing_subscriber::EnvFilter;

/// Build the event filter: `RUST_LOG` if present, otherwise `level`.
pub fn filter(level: &str) -> DaqResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| DaqError::Configuration(format!("invalid log filter '{level}': {e}")))
}

/// Install the global subscriber, as plain text or JSON lines.
pub fn init(level: &str, json: bool) -> DaqResult<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(level)?);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| DaqError::Configuration(format!("logging already initialised: {e}")))
}
