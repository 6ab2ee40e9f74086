//! Consul client errors

use thiserror::Error;

/// Errors that can occur when talking to a Consul agent
#[derive(Debug, Error)]
pub enum ConsulError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Consul answered with a non-success status
    #[error("Consul API error: {status} - {body}")]
    Api { status: u16, body: String },

    /// Resource not found (unknown session, missing key, ...)
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// KV value was not valid base64
    #[error("Decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Invalid request (e.g., bad address)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
