//! Engine configuration loading.
//!
//! Reads `toolstream.yaml` and resolves environment variables. Every field
//! has a default, so an empty file (or no file at all) yields a working
//! configuration pointed at a local Ollama server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::inference::ChatOptions;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TOOLSTREAM_CONFIG";

/// File name searched for in the working directory and its ancestors.
pub const CONFIG_FILE_NAME: &str = "toolstream.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level engine configuration (mirrors `toolstream.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub orchestration: OrchestrationSection,
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    /// Directory for the transcript database and tool-schema cache.
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub data_dir: Option<String>,
}

/// The model service and sampling options.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub num_ctx: Option<u32>,
    #[serde(default)]
    pub seed: Option<i64>,
}

/// Loop bounds and tool routing.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationSection {
    /// Hard bound on tool calls per stream.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Provider that receives tool names without a `provider.` prefix.
    #[serde(default = "default_dynamic_provider")]
    pub dynamic_provider: String,
    /// Identity under which provider connections are shared.
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Insert a tool-listing system prompt when the history has none.
    #[serde(default = "default_true")]
    pub compose_system_prompt: bool,
}

/// Where provider definitions live and how they are brought up.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersSection {
    /// JSON file with `{"mcpServers": {...}}`. Relative paths resolve against
    /// the directory containing the YAML file.
    #[serde(default = "default_providers_path")]
    pub config_path: String,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Persist discovered tool schemas across restarts.
    #[serde(default = "default_true")]
    pub schema_cache: bool,
}

/// Staleness sweep for abandoned streams.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}
fn default_model_name() -> String {
    "llama3.1".into()
}
fn default_connect_timeout_secs() -> u64 {
    crate::inference::client::DEFAULT_CONNECT_TIMEOUT.as_secs()
}
fn default_stream_timeout_secs() -> u64 {
    crate::inference::client::DEFAULT_STREAM_TIMEOUT.as_secs()
}
fn default_max_cycles() -> u32 {
    crate::agent_core::DEFAULT_MAX_CYCLES
}
fn default_dynamic_provider() -> String {
    crate::mcp_client::DEFAULT_DYNAMIC_PROVIDER.into()
}
fn default_identity() -> String {
    "user".into()
}
fn default_call_timeout_ms() -> u64 {
    crate::mcp_client::manager::DEFAULT_CALL_TIMEOUT_MS
}
fn default_true() -> bool {
    true
}
fn default_providers_path() -> String {
    "mcp_config.json".into()
}
fn default_init_timeout_secs() -> u64 {
    30
}
fn default_ping_timeout_secs() -> u64 {
    5
}
fn default_stale_after_secs() -> u64 {
    10 * 60
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            name: default_model_name(),
            connect_timeout_secs: default_connect_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            temperature: None,
            top_p: None,
            num_ctx: None,
            seed: None,
        }
    }
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            dynamic_provider: default_dynamic_provider(),
            identity: default_identity(),
            call_timeout_ms: default_call_timeout_ms(),
            compose_system_prompt: true,
        }
    }
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            config_path: default_providers_path(),
            init_timeout_secs: default_init_timeout_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            schema_cache: true,
        }
    }
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ModelSection {
    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            top_p: self.top_p,
            num_ctx: self.num_ctx,
            seed: self.seed,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

impl SessionsSection {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl EngineConfig {
    /// Parse YAML text after env-var interpolation.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        // An empty document deserializes as null, not as an empty mapping.
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EngineConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
                path: "<inline>".into(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestration.max_cycles == 0 {
            return Err(ConfigError::Invalid {
                reason: "orchestration.max_cycles must be at least 1".into(),
            });
        }
        if self.orchestration.dynamic_provider.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "orchestration.dynamic_provider must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Provider definition file, resolved against `base_dir`.
    pub fn providers_path(&self, base_dir: &Path) -> PathBuf {
        resolve_path(&self.providers.config_path, base_dir)
    }

    /// Data directory, falling back to the platform default.
    pub fn data_dir(&self, base_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(dir) => resolve_path(dir, base_dir),
            None => crate::data_dir(),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Resolution order:
/// 1. `TOOLSTREAM_CONFIG`, if it names an existing file.
/// 2. `toolstream.yaml` in `start` or any ancestor.
/// 3. `<config dir>/toolstream/config.yaml`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file");
    }

    if let Some(found) = search_upward(start) {
        return Some(found);
    }

    dirs::config_dir()
        .map(|dir| dir.join("toolstream").join("config.yaml"))
        .filter(|p| p.is_file())
}

fn search_upward(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and parse an engine config file.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    EngineConfig::from_yaml_str(&raw).map_err(|e| match e {
        ConfigError::Parse { reason, .. } => ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        },
        other => other,
    })
}

fn resolve_path(path: &str, base_dir: &Path) -> PathBuf {
    let expanded = PathBuf::from(expand_tilde(path));
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config.model.base_url, "http://localhost:11434");
        assert_eq!(config.orchestration.max_cycles, 20);
        assert_eq!(config.orchestration.dynamic_provider, "mcp-dynamic-tools");
        assert_eq!(config.providers.config_path, "mcp_config.json");
        assert_eq!(config.sessions.stale_after(), Duration::from_secs(600));
        assert!(config.model.chat_options().is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
            model:
              name: qwen2.5:7b
              temperature: 0.2
            orchestration:
              max_cycles: 5
              dynamic_provider: tools
        "#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.model.name, "qwen2.5:7b");
        assert_eq!(config.model.connect_timeout_secs, 5);
        assert_eq!(config.model.chat_options().temperature, Some(0.2));
        assert_eq!(config.orchestration.max_cycles, 5);
        assert_eq!(config.orchestration.dynamic_provider, "tools");
        assert_eq!(config.orchestration.identity, "user");
        assert!(config.orchestration.compose_system_prompt);
    }

    #[test]
    fn test_zero_max_cycles_rejected() {
        let err = EngineConfig::from_yaml_str("orchestration:\n  max_cycles: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "model: [unclosed").unwrap();
        match load_engine_config(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert!(p.ends_with(CONFIG_FILE_NAME)),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLSTREAM_TEST_UNSET__");
        assert_eq!(
            interpolate_env_vars("${__TOOLSTREAM_TEST_UNSET__:-/fallback/path}"),
            "/fallback/path"
        );
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLSTREAM_TEST_MODEL__", "mistral");
        let config =
            EngineConfig::from_yaml_str("model:\n  name: ${__TOOLSTREAM_TEST_MODEL__:-llama3.1}\n")
                .unwrap();
        assert_eq!(config.model.name, "mistral");
        std::env::remove_var("__TOOLSTREAM_TEST_MODEL__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $dollar and {braces}";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/Documents"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn test_search_upward_finds_ancestor_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "").unwrap();

        assert_eq!(search_upward(&nested), Some(dir.path().join(CONFIG_FILE_NAME)));
    }

    #[test]
    fn test_paths_resolve_against_base_dir() {
        let config = EngineConfig::from_yaml_str(
            "providers:\n  config_path: servers.json\ndata_dir: /var/lib/toolstream\n",
        )
        .unwrap();
        let base = Path::new("/etc/toolstream");
        assert_eq!(config.providers_path(base), PathBuf::from("/etc/toolstream/servers.json"));
        assert_eq!(config.data_dir(base), PathBuf::from("/var/lib/toolstream"));
    }
}
