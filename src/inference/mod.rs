//! Inference Client: streaming chat against a local Ollama server.
//!
//! This module handles all communication with the model service:
//! - Streaming chat requests (`POST /api/chat`, NDJSON)
//! - Installed-model listing (`GET /api/tags`)
//! - The [`ModelStream`] seam the orchestration loop is written against
//!
//! The model is interchangeable: the loop only ever asks for "a token stream
//! for this history".

pub mod client;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{ModelStream, OllamaClient, TokenStream};
pub use errors::InferenceError;
pub use types::{ChatMessage, ChatOptions, ModelInfo, Role};
