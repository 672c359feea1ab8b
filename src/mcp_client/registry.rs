//! Tool Provider Registry: named provider configurations and lookup.
//!
//! Pure data: launch commands, optional SSE endpoints, and pre-seeded tool
//! schemas, loaded from a `{"mcpServers": {...}}` JSON file. No process
//! management happens here.

use std::collections::HashMap;
use std::path::Path;

use super::errors::McpError;
use super::types::{ProviderConfig, ProvidersConfig, ToolDescriptor, TransportKind};

// ─── Registry ────────────────────────────────────────────────────────────────

/// Read-only lookup over provider configurations.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    configs: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    /// Build a registry from a parsed configuration file.
    pub fn new(config: ProvidersConfig) -> Self {
        Self {
            configs: config.providers,
        }
    }

    /// Configuration for one provider, if it exists.
    pub fn get_config(&self, name: &str) -> Option<&ProviderConfig> {
        self.configs.get(name)
    }

    /// All provider configurations keyed by name.
    pub fn all_configs(&self) -> &HashMap<String, ProviderConfig> {
        &self.configs
    }

    /// Provider names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Providers flagged `autoStart`, sorted.
    pub fn auto_start_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs
            .iter()
            .filter(|(_, c)| c.auto_start)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Tool schemas declared in the provider's `cachedTools` entry.
    pub fn seeded_tools(&self, name: &str) -> Vec<ToolDescriptor> {
        let Some(config) = self.configs.get(name) else {
            return Vec::new();
        };
        config
            .cached_tools
            .iter()
            .map(|spec| ToolDescriptor {
                provider: name.to_string(),
                name: spec.name.clone(),
                description: spec
                    .description
                    .clone()
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| format!("Tool provided by {name}")),
                parameter_schema: spec.parameters.clone(),
            })
            .collect()
    }
}

// ─── Transport Inference ─────────────────────────────────────────────────────

/// Decide how to reach a provider from its static configuration.
///
/// - explicit `url` → SSE to that url
/// - `python`/`python3`/`uv` launched with `--port N` → SSE to `http://localhost:N/sse`
/// - anything else → stdio
pub fn infer_transport(config: &ProviderConfig) -> TransportKind {
    if let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) {
        return TransportKind::Sse {
            url: url.to_string(),
        };
    }

    let command = Path::new(&config.command)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(&config.command);

    if matches!(command, "python" | "python3" | "uv") {
        if let Some(idx) = config.args.iter().position(|a| a == "--port") {
            if let Some(port) = config.args.get(idx + 1) {
                return TransportKind::Sse {
                    url: format!("http://localhost:{port}/sse"),
                };
            }
        }
    }

    TransportKind::Stdio
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load the provider configuration file.
///
/// A missing file yields an empty configuration. The legacy array form
/// (`{"servers": [{"name": ..., ...}]}`) is converted and written back in the
/// keyed form.
pub fn load_providers_config(path: &Path) -> Result<ProvidersConfig, McpError> {
    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "provider config not found, using empty configuration"
        );
        return Ok(ProvidersConfig::default());
    }

    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse {}: {e}", path.display()),
    })?;

    if value.get("mcpServers").is_none() {
        if let Some(servers) = value.get("servers").and_then(|s| s.as_array()) {
            let converted = convert_legacy_servers(servers)?;
            persist_converted(path, &converted);
            return Ok(converted);
        }
    }

    serde_json::from_value(value).map_err(|e| McpError::ConfigError {
        reason: format!("invalid provider config {}: {e}", path.display()),
    })
}

/// Convert the legacy `servers` array into the keyed map.
fn convert_legacy_servers(servers: &[serde_json::Value]) -> Result<ProvidersConfig, McpError> {
    let mut providers = HashMap::new();

    for entry in servers {
        let mut entry = entry.clone();
        let name = entry
            .as_object_mut()
            .and_then(|obj| obj.remove("name"))
            .and_then(|n| n.as_str().map(String::from))
            .unwrap_or_else(|| format!("server_{}", providers.len()));

        let config: ProviderConfig =
            serde_json::from_value(entry).map_err(|e| McpError::ConfigError {
                reason: format!("invalid legacy server entry '{name}': {e}"),
            })?;
        providers.insert(name, config);
    }

    Ok(ProvidersConfig { providers })
}

/// Best-effort rewrite of a converted legacy file.
fn persist_converted(path: &Path, config: &ProvidersConfig) {
    let written = serde_json::to_string_pretty(config)
        .map_err(|e| e.to_string())
        .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));

    match written {
        Ok(()) => tracing::info!(
            path = %path.display(),
            providers = config.providers.len(),
            "converted legacy provider config"
        ),
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to save converted provider config"
        ),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
