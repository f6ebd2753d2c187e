//! Tracing subscriber setup shared by the binaries

use crate::config::TelemetryConfig;
use crate::error::UnderwritingError;
use crate::Result;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins when set; otherwise the configured level is used.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            UnderwritingError::ConfigError(format!(
                "invalid log level/filter '{}': {}",
                config.log_level, e
            ))
        })?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| UnderwritingError::ConfigError(format!("telemetry error: {}", e)))
}
