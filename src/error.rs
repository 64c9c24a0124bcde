//! Single canonical error enum for the pipeline, built with `thiserror`.
//!
//! Variants are coarse-grained by domain (I/O, serialization, network…).
//! `#[from]` wires std/external error conversions automatically. No variant
//! carries secret material (API keys, encryption keys) in its message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Filesystem or OS-level I/O failure (queue persistence).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (transport layer).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Malformed DSN or invalid endpoint URL.
    #[error("invalid DSN: {0}")]
    InvalidDsn(String),

    /// OS keychain / credential store failure.
    #[error("keystore error: {0}")]
    Keystore(String),

    /// AEAD encrypt/decrypt failure on the persisted queue blob.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Transport rejected the batch with a non-retryable status.
    #[error("server rejected batch: HTTP {status}: {message}")]
    ServerRejected { status: u16, message: String },

    /// The circuit breaker for an endpoint is open; the call was not attempted.
    #[error("circuit open for endpoint {0}")]
    CircuitOpen(String),

    /// Pipeline is not in a state that allows the requested operation.
    #[error("invalid pipeline state: {0}")]
    InvalidState(String),

    /// Analytics collection has been disabled via `set_enabled(false)`.
    #[error("analytics is disabled")]
    AnalyticsDisabled,

    /// Configuration is invalid or incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn keystore(message: impl Into<String>) -> Self {
        Self::Keystore(message.into())
    }

    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption(message.into())
    }
}

impl From<String> for PipelineError {
    fn from(s: String) -> Self {
        PipelineError::Other(s)
    }
}

impl From<&str> for PipelineError {
    fn from(s: &str) -> Self {
        PipelineError::Other(s.to_string())
    }
}

impl From<PipelineError> for String {
    fn from(e: PipelineError) -> Self {
        e.to_string()
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
