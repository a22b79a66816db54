//! crates/logging/src/init.rs
//! Global subscriber installation.

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogConfig, LogFormat};

/// Failure to install the global subscriber.
#[derive(Debug, Error)]
pub enum InitError {
    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
    /// JSON output was requested without the `json` feature.
    #[error("log format `json` requires the `json` feature")]
    FormatUnavailable,
}

/// Builds the event filter: `RUST_LOG` when set and valid, the configured
/// level otherwise.
#[must_use]
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level().as_directive()))
}

/// Installs the global subscriber described by `config`.
///
/// Returns an error when called a second time in the same process.
pub fn init_tracing(config: &LogConfig) -> Result<(), InitError> {
    let filter = build_filter(config);
    let registry = tracing_subscriber::registry().with(filter);
    let fmt_layer = tracing_subscriber::fmt::layer().with_ansi(config.ansi());

    match config.format() {
        LogFormat::Full => registry.with(fmt_layer).try_init()?,
        LogFormat::Compact => registry.with(fmt_layer.compact()).try_init()?,
        #[cfg(feature = "json")]
        LogFormat::Json => registry
            .with(fmt_layer.json().flatten_event(true))
            .try_init()?,
        #[cfg(not(feature = "json"))]
        LogFormat::Json => return Err(InitError::FormatUnavailable),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn filter_uses_configured_level_without_env() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = build_filter(&LogConfig::default().with_level(LogLevel::Debug));
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn second_init_fails() {
        let config = LogConfig::default().with_format(LogFormat::Compact).with_ansi(false);
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
