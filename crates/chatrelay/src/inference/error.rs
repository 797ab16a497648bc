//! Inference client error types.

use thiserror::Error;

/// Result type for inference operations.
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Errors that can occur while talking to the inference backend.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Backend answered with a non-success status.
    #[error("inference backend error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Failed to reach the backend at all.
    #[error("Failed to connect to inference backend at {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Model identifier cannot be placed in a request path.
    #[error("invalid model identifier: {0:?}")]
    InvalidModel(String),

    /// Stream ended abnormally.
    #[error("stream error: {0}")]
    Stream(String),
}
