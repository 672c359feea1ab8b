//! Translate tool failures into short, model-readable remediation strings.
//!
//! The orchestration loop always splices *some* string into the history, so
//! every failure a provider can produce ends up here instead of propagating.

use serde_json::{Map, Value};

use super::errors::McpError;

/// The failing call, as the model issued it.
#[derive(Debug, Clone, Copy)]
pub struct FailedCall<'a> {
    pub provider: &'a str,
    pub tool: &'a str,
    pub arguments: &'a Map<String, Value>,
}

impl FailedCall<'_> {
    fn path(&self) -> Option<&str> {
        self.arguments.get("path").and_then(|p| p.as_str())
    }
}

/// Remediation text for a structured client error.
pub fn remediate_error(call: FailedCall<'_>, err: &McpError) -> String {
    match err {
        McpError::UnknownProvider { name } => unknown_provider(name),
        McpError::ServerError { message, .. } => remediate_message(call, message),
        other => remediate_message(call, &other.to_string()),
    }
}

/// Unknown-provider text, also used before any connection is attempted.
pub fn unknown_provider(name: &str) -> String {
    format!(
        "Unknown provider: '{name}' is not configured. Check the tool name, or ask \"what tools are available?\" to see the configured providers."
    )
}

/// Match known failure signatures in a raw error message.
pub fn remediate_message(call: FailedCall<'_>, message: &str) -> String {
    let lower = message.to_lowercase();

    if lower.contains("no such file or directory") || lower.contains("file not found") {
        return format!(
            "File not found: {}. The file does not exist. You may need to create it first or check the path.",
            call.path().unwrap_or("unknown file")
        );
    }
    if lower.contains("permission denied") || lower.contains("access denied") {
        return format!(
            "Permission denied: Cannot access {}. Check file permissions.",
            call.path().unwrap_or("unknown file")
        );
    }
    if lower.contains("directory not found") || lower.contains("no such directory") {
        return format!(
            "Directory not found: {}. The directory does not exist. You may need to create it first.",
            call.path().unwrap_or("unknown directory")
        );
    }
    if lower.contains("is a directory") {
        return format!(
            "Path error: {} is a directory, not a file. Use list_directory to see its contents.",
            call.path().unwrap_or("unknown path")
        );
    }
    if lower.contains("not found") {
        return format!(
            "Tool '{}.{}' not found. Available tools can be viewed by asking \"what tools are available?\" or create a new tool by asking me to \"create an MCP tool\".",
            call.provider, call.tool
        );
    }

    format!("Error executing tool: {message}")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
