//! MCP Client: tool providers reached over JSON-RPC.
//!
//! This module handles:
//! - Provider configuration and transport inference (stdio or SSE)
//! - Spawning provider processes and the `initialize` / `ping` / `tools/list` handshake
//! - One shared connection per `(provider, identity)`, established single-flight
//! - Tool invocation with result normalization and error remediation
//! - A persistent SQLite cache of discovered tool schemas
//!
//! The orchestration loop reaches providers only through
//! [`ConnectionManager`].

pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod normalize;
pub mod registry;
pub mod remediation;
pub mod schema_cache;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::McpError;
pub use manager::{
    ConnectionManager, Connector, ManagerOptions, ProcessConnector, ProviderConnection,
    ToolCallOutcome, DEFAULT_DYNAMIC_PROVIDER,
};
pub use normalize::ToolOutput;
pub use registry::{infer_transport, load_providers_config, ProviderRegistry};
pub use schema_cache::ToolSchemaCache;
pub use types::{ProviderConfig, ProvidersConfig, ToolDescriptor, TransportKind};
