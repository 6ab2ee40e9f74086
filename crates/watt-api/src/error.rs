//! Watt API errors

use thiserror::Error;

/// Errors raised while decoding or rendering watt API values.
#[derive(Debug, Error)]
pub enum ApiError {
    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A JSON value that cannot be used as a resource
    #[error("Invalid resource: {0}")]
    InvalidResource(String),
}
