//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur while connecting to or calling tool providers.
#[derive(Debug, Error)]
pub enum McpError {
    /// A provider subprocess failed to start.
    #[error("failed to spawn provider '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake or ping liveness check failed.
    #[error("provider '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for provider '{provider}': {reason}")]
    TransportError {
        provider: String,
        reason: String,
    },

    /// Provider returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No configuration exists for the named provider.
    #[error("unknown provider: '{name}'")]
    UnknownProvider {
        name: String,
    },

    /// The provider has no live connection for this identity.
    #[error("provider '{provider}' is not connected for '{identity}': {reason}")]
    NotConnected {
        provider: String,
        identity: String,
        reason: String,
    },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout {
        tool: String,
        timeout_ms: u64,
    },

    /// Configuration error (unreadable or malformed provider file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// Tool-schema cache read or write failed.
    #[error("schema cache error: {reason}")]
    CacheError {
        reason: String,
    },
}

impl From<rusqlite::Error> for McpError {
    fn from(e: rusqlite::Error) -> Self {
        McpError::CacheError {
            reason: e.to_string(),
        }
    }
}
