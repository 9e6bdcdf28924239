//! Error types for the xDS client.

use thiserror::Error;

/// Error type for the xDS client.
#[derive(Debug, Error)]
pub enum Error {
    /// A response, request, or configuration value failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Failed to decode a wire message.
    #[cfg(feature = "codegen-prost")]
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Failed to establish a transport connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport stream returned an error mid-stream.
    #[cfg(feature = "transport-tonic")]
    #[error("stream error: {0}")]
    Stream(#[from] tonic::Status),

    /// The transport's send half closed unexpectedly.
    #[error("stream closed")]
    StreamClosed,
}

/// Result type alias for xDS client operations.
pub type Result<T> = std::result::Result<T, Error>;
