//! Error types for cluster access and label parsing.

use thiserror::Error;

/// Errors returned by orchestrator clients.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The orchestrator endpoint could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The orchestrator answered with a non-success status.
    #[error("orchestrator API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors raised while interpreting `expose.*` labels.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LabelError {
    /// `expose.port` is not a valid port number.
    #[error("invalid port selector {value:?}")]
    InvalidPort { value: String },
}
