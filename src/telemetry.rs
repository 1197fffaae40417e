//! Tracing subscriber setup.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSection};

/// Build the filter from `RUST_LOG` if set, otherwise from the configured level.
pub fn env_filter(logging: &LoggingSection) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if logging.level.trim().is_empty() {
        "info"
    } else {
        logging.level.as_str()
    };
    EnvFilter::try_new(level).with_context(|| format!("Invalid log filter '{}'", level))
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init(logging: &LoggingSection) -> Result<()> {
    let filter = env_filter(logging)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
