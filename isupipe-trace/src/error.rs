use crate::config::Backend;
use opentelemetry_sdk::error::OTelSdkError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`init_provider`](crate::init_provider).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InitError {
    /// The exporter for the selected backend could not be constructed.
    #[error("failed to initialize {backend} exporter: {reason}")]
    ExporterInitFailure {
        /// Backend whose exporter failed.
        backend: Backend,
        /// Human readable cause, for logging only.
        reason: String,
    },
}

impl InitError {
    pub(crate) fn exporter(backend: Backend, reason: impl Into<String>) -> Self {
        InitError::ExporterInitFailure {
            backend,
            reason: reason.into(),
        }
    }
}

/// Errors returned while flushing or shutting down the active provider.
///
/// These are best effort: callers are expected to log them and carry on.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlushError {
    /// Buffered spans could not be drained within the bound; they are dropped.
    #[error("flush timed out after {0:?}")]
    Timeout(Duration),

    /// The processor or exporter reported a failure.
    #[error("flush failed: {0}")]
    Failed(String),
}

impl From<OTelSdkError> for FlushError {
    fn from(err: OTelSdkError) -> Self {
        match err {
            OTelSdkError::Timeout(timeout) => FlushError::Timeout(timeout),
            other => FlushError::Failed(other.to_string()),
        }
    }
}

/// Errors returned when parsing configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The value is not one of the recognized options.
    #[error("unknown {option} {value:?}")]
    UnknownValue {
        /// Name of the option being parsed.
        option: &'static str,
        /// The rejected value.
        value: String,
    },
}
