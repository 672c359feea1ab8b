//! Shared types for the inference client.
//!
//! These mirror the Ollama `/api/chat` and `/api/tags` wire formats, used for
//! both request building and response parsing.

use serde::{Deserialize, Serialize};

// ─── Conversation ────────────────────────────────────────────────────────────

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Per-request sampling options, sent as Ollama's `options` object.
///
/// Unset fields are omitted so the server's model defaults apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Context window size in tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl ChatOptions {
    pub fn is_empty(&self) -> bool {
        *self == ChatOptions::default()
    }
}

// ─── Request Types ───────────────────────────────────────────────────────────

/// Request body for `POST /api/chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    #[serde(skip_serializing_if = "ChatOptions::is_empty")]
    pub options: ChatOptions,
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// One NDJSON line from a streaming `/api/chat` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponseLine {
    #[serde(default)]
    pub message: Option<ResponseMessage>,
    #[serde(default)]
    pub done: bool,
    /// Set when the server aborts the stream (e.g. model crashed).
    #[serde(default)]
    pub error: Option<String>,
}

/// The `message` object inside a response line.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: String,
}

/// Response body for `GET /api/tags`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// An installed model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn test_request_omits_empty_options() {
        let messages = vec![ChatMessage::user("hello")];
        let req = ChatRequest {
            model: "llama3.1",
            messages: &messages,
            stream: true,
            options: ChatOptions::default(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("options").is_none());
        assert_eq!(json["stream"], true);

        let req = ChatRequest {
            options: ChatOptions {
                temperature: Some(0.2),
                ..Default::default()
            },
            ..req
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json["options"]["temperature"].as_f64().is_some());
        assert!(json["options"].get("top_p").is_none());
    }

    #[test]
    fn test_response_line_shapes() {
        let line: ChatResponseLine =
            serde_json::from_str(r#"{"model":"m","message":{"role":"assistant","content":"Hi"},"done":false}"#)
                .unwrap();
        assert_eq!(line.message.unwrap().content, "Hi");
        assert!(!line.done);

        let line: ChatResponseLine = serde_json::from_str(r#"{"error":"model crashed"}"#).unwrap();
        assert_eq!(line.error.as_deref(), Some("model crashed"));
    }

    #[test]
    fn test_model_list() {
        let list: ModelList = serde_json::from_str(
            r#"{"models":[{"name":"llama3.1:8b","size":4661224676,"modified_at":"2024-08-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        assert_eq!(list.models[0].name, "llama3.1:8b");
    }
}
