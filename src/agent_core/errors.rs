//! Agent Core error types.
//!
//! Only [`AgentError::StreamTransportError`] and
//! [`AgentError::CycleLimitExceeded`] end a session. Everything else is
//! recovered locally and shows up as content in the conversation.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::McpError;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A tool call named a provider with no configuration.
    #[error("unknown provider: '{provider}'")]
    ProviderUnknown { provider: String },

    /// Connecting to the provider failed. Not retried until refresh.
    #[error("provider '{provider}' unreachable: {reason}")]
    ProviderUnreachable { provider: String, reason: String },

    /// A candidate payload was not a valid tool call.
    #[error("malformed tool call: {reason}")]
    MalformedToolCall { reason: String },

    /// The provider was reached but the tool failed.
    #[error("tool execution failed: {reason}")]
    ToolExecutionError { reason: String },

    /// The loop hit its tool-call bound.
    #[error("stopped after {max} tool calls")]
    CycleLimitExceeded { max: u32 },

    /// The model stream could not be opened or broke mid-response.
    #[error("model stream failed: {reason}")]
    StreamTransportError { reason: String },

    /// The session was cancelled by its caller or the staleness sweep.
    #[error("stream '{channel_id}' cancelled")]
    CancellationRequested { channel_id: String },

    /// Transcript database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl AgentError {
    /// Whether this error ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentError::StreamTransportError { .. } | AgentError::CycleLimitExceeded { .. }
        )
    }

    /// Stable label, stored with failed transcript entries.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::ProviderUnknown { .. } => "provider_unknown",
            AgentError::ProviderUnreachable { .. } => "provider_unreachable",
            AgentError::MalformedToolCall { .. } => "malformed_tool_call",
            AgentError::ToolExecutionError { .. } => "tool_execution",
            AgentError::CycleLimitExceeded { .. } => "cycle_limit",
            AgentError::StreamTransportError { .. } => "stream_transport",
            AgentError::CancellationRequested { .. } => "cancelled",
            AgentError::DatabaseError { .. } => "database",
            AgentError::SerializationError { .. } => "serialization",
        }
    }
}

impl From<McpError> for AgentError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::UnknownProvider { name } => AgentError::ProviderUnknown { provider: name },
            McpError::SpawnFailed { name, reason } | McpError::InitFailed { name, reason } => {
                AgentError::ProviderUnreachable {
                    provider: name,
                    reason,
                }
            }
            McpError::NotConnected {
                provider, reason, ..
            }
            | McpError::TransportError { provider, reason } => AgentError::ProviderUnreachable {
                provider,
                reason,
            },
            McpError::CacheError { reason } => AgentError::DatabaseError { reason },
            other @ (McpError::ServerError { .. }
            | McpError::Timeout { .. }
            | McpError::ConfigError { .. }) => AgentError::ToolExecutionError {
                reason: other.to_string(),
            },
        }
    }
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        AgentError::StreamTransportError {
            reason: e.to_string(),
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
