//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility. These types carry the context needed to
//! build meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to the model service.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// NDJSON stream parsing or read error, or an `error` line from the server.
    #[error("stream error: {reason}")]
    StreamError {
        reason: String,
    },

    /// The requested model is not installed on the server.
    #[error("model not found: {model}")]
    ModelNotFound {
        model: String,
    },
}

impl InferenceError {
    /// Whether a retry against the same endpoint could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::ConnectionFailed { .. } | InferenceError::Timeout { .. } => true,
            InferenceError::HttpError { status, .. } => *status >= 500,
            InferenceError::StreamError { .. } | InferenceError::ModelNotFound { .. } => false,
        }
    }
}
