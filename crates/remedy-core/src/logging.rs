//! Tracing subscriber setup shared by every binary in the workspace.

use tracing_subscriber::EnvFilter;

use crate::error::{RemedyError, Result};

/// Build the env filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber has already been installed.
pub fn init_tracing(level: &str, json: bool) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(level));
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| RemedyError::Logging(e.to_string()))
}
