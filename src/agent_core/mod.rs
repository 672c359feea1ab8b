//! Agent Core: the streaming tool-call loop.
//!
//! Submodules:
//! - `classifier`: Separates pass-through text from embedded tool calls
//! - `orchestrator`: Stream → detect → invoke → splice → restream loop
//! - `prompts`: Monitoring prompt and system-prompt composition
//! - `sessions`: In-flight stream registry, cancellation, staleness sweep
//! - `database`: SQLite tool transcript and stream outcomes
//! - `errors`: Agent-level error types

pub mod classifier;
pub mod database;
pub mod errors;
pub mod orchestrator;
pub mod prompts;
pub mod sessions;

// Re-exports for convenience
pub use classifier::{ToolCall, TokenClass, TokenClassifier};
pub use database::AgentDatabase;
pub use errors::AgentError;
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, OutputSink, StreamEvent, StreamOutcome, StreamRequest,
    StreamStatus, ToolInvoker, DEFAULT_MAX_CYCLES,
};
pub use prompts::{PromptComposer, ToolListComposer};
pub use sessions::StreamRegistry;
