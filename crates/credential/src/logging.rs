//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; binaries call [`init`] once to
//! install a registry with an [`EnvFilter`] and one fmt layer. `RUST_LOG`
//! overrides the configured level when set.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::core::ConfigurationError;

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `keyward_credential=debug`
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Installs the global subscriber, writing to stderr.
///
/// Fails instead of panicking when the filter is malformed or a global
/// subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<(), ConfigurationError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            ConfigurationError::Invalid(format!("invalid log level '{}': {e}", config.level))
        })?,
    };

    let registry = Registry::default().with(filter);
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|e| ConfigurationError::Invalid(format!("failed to install logger: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_deserializes_lowercase() {
        let config: LogConfig =
            serde_json::from_str(r#"{"level":"debug","format":"json"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "debug");
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = LogConfig::default();
        // The first call may race with other tests; only the second must fail.
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
