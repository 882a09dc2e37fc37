//! Process-wide `tracing` subscriber setup.

use std::sync::Once;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `filter` and then [`DEFAULT_LOG_FILTER`].
///
/// A second call returns [`LoggingError::AlreadyInitialized`].
pub fn init_logging(filter: Option<&str>) -> Result<(), LoggingError> {
    let env_filter = build_filter(filter)?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|error| LoggingError::AlreadyInitialized(error.to_string()))
}

/// Test-writer subscriber; only installed when `TEST_LOG` is set.
pub fn init_test_logging() {
    if std::env::var_os("TEST_LOG").is_none() {
        return;
    }

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .try_init();
    });
}

fn build_filter(filter: Option<&str>) -> Result<EnvFilter, LoggingError> {
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        return Ok(env_filter);
    }
    let directive = filter
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER);
    EnvFilter::try_new(directive).map_err(|error| LoggingError::InvalidFilter {
        filter: directive.to_owned(),
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{build_filter, LoggingError};

    #[test]
    fn rejects_malformed_directive_when_env_is_unset() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(build_filter(Some("chat_sync=debug")).is_ok());
        assert!(build_filter(Some("   ")).is_ok());
        assert!(matches!(
            build_filter(Some("chat_sync=loud")),
            Err(LoggingError::InvalidFilter { .. })
        ));
    }
}
