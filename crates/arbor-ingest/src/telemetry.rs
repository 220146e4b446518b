//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("global tracing subscriber already installed")]
    AlreadyInstalled,

    #[error("failed to install log bridge: {0}")]
    LogBridge(String),
}

/// Builds the filter: `RUST_LOG` when set, the configured level otherwise.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| TelemetryError::InvalidFilter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Installs the global subscriber and bridges `log` records into it.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(config)?;

    let installed = match config.format {
        LogFormat::Human => tracing::subscriber::set_global_default(
            Registry::default()
                .with(filter)
                .with(fmt::layer().with_target(false)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            Registry::default()
                .with(filter)
                .with(fmt::layer().json().with_current_span(true)),
        ),
    };
    installed.map_err(|_| TelemetryError::AlreadyInstalled)?;

    tracing_log::LogTracer::init().map_err(|e| TelemetryError::LogBridge(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "arbor_ingest=loud[".to_string(),
            format: LogFormat::Human,
        };
        assert!(matches!(
            build_filter(&config),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_configured_level_used_without_env() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "debug,arbor_ingest::db=warn".to_string(),
            format: LogFormat::Json,
        };
        assert!(build_filter(&config).is_ok());
    }
}
