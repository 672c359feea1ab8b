//! Tool result normalization.
//!
//! Providers answer `tools/call` with a plain string, an MCP `content` list of
//! typed parts, or arbitrary JSON. Each shape is matched by one row of
//! [`RULES`]; the first row that accepts the value wins.

use std::fmt;

use serde_json::Value;

// ─── ToolOutput ──────────────────────────────────────────────────────────────

/// A provider result reduced to one of two shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Human-readable text.
    Text(String),
    /// JSON with no recognised text field, shown pretty-printed.
    Structured(Value),
}

impl ToolOutput {
    /// Collapse to the string spliced into the conversation.
    pub fn into_display(self) -> String {
        match self {
            ToolOutput::Text(text) => text,
            ToolOutput::Structured(value) => {
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutput::Text(text) => f.write_str(text),
            ToolOutput::Structured(value) => match serde_json::to_string_pretty(value) {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{value}"),
            },
        }
    }
}

// ─── Rule Table ──────────────────────────────────────────────────────────────

/// One shape → extraction rule.
struct Rule {
    name: &'static str,
    extract: fn(&Value) -> Option<ToolOutput>,
}

/// Extraction rules, tried in order.
const RULES: &[Rule] = &[
    Rule {
        name: "null",
        extract: extract_null,
    },
    Rule {
        name: "string",
        extract: extract_string,
    },
    Rule {
        name: "content-parts",
        extract: extract_content_parts,
    },
    Rule {
        name: "structured",
        extract: extract_structured,
    },
];

fn extract_null(value: &Value) -> Option<ToolOutput> {
    value
        .is_null()
        .then(|| ToolOutput::Text("No result returned.".to_string()))
}

fn extract_string(value: &Value) -> Option<ToolOutput> {
    value.as_str().map(|s| ToolOutput::Text(s.to_string()))
}

/// `{"content": [{"type": "text", "text": "..."}, ...]}`: text parts joined by newlines.
fn extract_content_parts(value: &Value) -> Option<ToolOutput> {
    let parts = value.get("content")?.as_array()?;
    let texts: Vec<&str> = parts
        .iter()
        .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
        .collect();
    if texts.is_empty() {
        return None;
    }
    Some(ToolOutput::Text(texts.join("\n")))
}

fn extract_structured(value: &Value) -> Option<ToolOutput> {
    Some(ToolOutput::Structured(value.clone()))
}

/// Normalize a raw `tools/call` result.
pub fn normalize(value: &Value) -> ToolOutput {
    for rule in RULES {
        if let Some(output) = (rule.extract)(value) {
            tracing::trace!(rule = rule.name, "tool result normalized");
            return output;
        }
    }
    ToolOutput::Structured(value.clone())
}

/// Whether the provider flagged the result as a tool-level failure (`isError`).
pub fn is_error_result(value: &Value) -> bool {
    value
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
