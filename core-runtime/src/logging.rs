//! # Logging & Tracing Infrastructure
//!
//! Structured logging with the `tracing` crate, supporting pretty, compact
//! and JSON output formats with module-level filtering via `EnvFilter`.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! always an explicit host decision. Call [`init_logging`] once from the
//! embedding application, or install any other `tracing` subscriber instead.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//!
//! init_logging(LoggingConfig::default().with_format(LogFormat::Compact))?;
//! tracing::info!("manager starting");
//! ```

use crate::error::{Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format.
    Pretty,
    /// Compact single-line format.
    Compact,
    /// Structured JSON for machine parsing.
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Filter directives (`info`, `core_index=debug`, ...). Falls back to the
    /// `RUST_LOG` environment variable, then to `info`.
    pub filter: Option<String>,
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Install a global `tracing` subscriber according to `config`.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = match &config.filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|err| Error::LoggingInit(err.to_string()))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|err| Error::LoggingInit(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_explicit_filter() {
        let config = LoggingConfig::default();
        assert!(config.filter.is_none());
    }

    #[test]
    fn builder_style_setters_compose() {
        let config = LoggingConfig::default()
            .with_format(LogFormat::Json)
            .with_filter("core_index=debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter.as_deref(), Some("core_index=debug"));
    }

    #[test]
    fn invalid_filter_directives_error() {
        let err = init_logging(LoggingConfig::default().with_filter("=bad=filter=")).unwrap_err();
        assert!(matches!(err, Error::LoggingInit(_)));
    }
}
