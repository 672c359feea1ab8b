//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the provider
//! configuration file format (`{"mcpServers": {...}}`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// A tool as exposed to the orchestration engine.
///
/// `parameter_schema` holds the `properties` map of the tool's input schema,
/// which is the shape cached and shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub provider: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameter_schema: serde_json::Map<String, serde_json::Value>,
}

impl ToolDescriptor {
    /// Build a descriptor from a provider's `tools/list` entry.
    pub fn from_definition(provider: &str, def: McpToolDefinition) -> Self {
        let parameter_schema = def
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .cloned()
            .unwrap_or_default();
        Self {
            provider: provider.to_string(),
            description: def
                .description
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| format!("Tool provided by {provider}")),
            name: def.name,
            parameter_schema,
        }
    }

    /// Fully-qualified `provider.tool` name, as the model addresses it.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.provider, self.name)
    }
}

/// Pre-seeded tool entry inside a provider config (`cachedTools`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

// ─── Provider Configuration ──────────────────────────────────────────────────

/// Provider configuration entry from `mcp.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the provider process.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Fixed SSE endpoint. When set, no subprocess is launched.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
    /// Tool schemas known before live discovery succeeds.
    #[serde(default, alias = "cached_tools")]
    pub cached_tools: Vec<CachedToolSpec>,
}

/// Top-level provider configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(rename = "mcpServers", default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// How the manager reaches a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// Line-delimited JSON-RPC over a subprocess's stdio.
    Stdio,
    /// JSON-RPC over an SSE endpoint.
    Sse { url: String },
}

impl TransportKind {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse { .. } => "sse",
        }
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "result": null,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_descriptor_from_definition_takes_properties() {
        let def: McpToolDefinition = serde_json::from_value(serde_json::json!({
            "name": "read_file",
            "inputSchema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }
        }))
        .unwrap();
        let desc = ToolDescriptor::from_definition("fs", def);
        assert_eq!(desc.qualified_name(), "fs.read_file");
        assert_eq!(desc.description, "Tool provided by fs");
        assert!(desc.parameter_schema.contains_key("path"));
        assert!(!desc.parameter_schema.contains_key("required"));
    }

    #[test]
    fn test_provider_config_camel_case() {
        let json = r#"{
            "mcpServers": {
                "desktop-commander": {
                    "command": "npx",
                    "args": ["@wonderwhy-er/desktop-commander@latest"],
                    "autoStart": true,
                    "cachedTools": [{"name": "read_file"}]
                }
            }
        }"#;
        let cfg: ProvidersConfig = serde_json::from_str(json).unwrap();
        let dc = &cfg.providers["desktop-commander"];
        assert!(dc.auto_start);
        assert_eq!(dc.cached_tools.len(), 1);
        assert!(dc.url.is_none());
    }
}
