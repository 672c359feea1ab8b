//! Engine facade.
//!
//! Wires configuration, provider registry, schema cache, connection manager,
//! model client, stream registry, and orchestrator into one owned value. The
//! binary (or any embedding host) talks to this type only.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent_core::prompts::prepare_history;
use crate::agent_core::{
    AgentDatabase, AgentError, Orchestrator, OrchestratorConfig, OutputSink, PromptComposer,
    StreamOutcome, StreamRegistry, StreamRequest, ToolInvoker, ToolListComposer,
};
use crate::config::EngineConfig;
use crate::inference::{ChatMessage, InferenceError, ModelInfo, ModelStream, OllamaClient};
use crate::mcp_client::lifecycle::ConnectTimeouts;
use crate::mcp_client::{
    load_providers_config, ConnectionManager, Connector, ManagerOptions, ProcessConnector,
    ProviderRegistry, ToolDescriptor, ToolSchemaCache,
};

const DATABASE_FILE: &str = "toolstream.db";

/// A spawned stream.
pub struct StreamHandle {
    pub channel_id: String,
    pub task: JoinHandle<Result<StreamOutcome, AgentError>>,
}

pub struct Engine {
    config: EngineConfig,
    manager: Arc<ConnectionManager>,
    model: Arc<OllamaClient>,
    sessions: Arc<StreamRegistry>,
    orchestrator: Arc<Orchestrator>,
    composer: Option<Arc<dyn PromptComposer>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Build an engine. Relative paths in `config` resolve against `base_dir`.
    pub fn from_config(config: EngineConfig, base_dir: &Path) -> anyhow::Result<Self> {
        let connector = Arc::new(ProcessConnector {
            timeouts: ConnectTimeouts {
                init: std::time::Duration::from_secs(config.providers.init_timeout_secs),
                ping: std::time::Duration::from_secs(config.providers.ping_timeout_secs),
            },
        });
        Self::with_connector(config, base_dir, connector)
    }

    /// Like [`from_config`](Self::from_config) with a custom way of reaching
    /// providers.
    pub fn with_connector(
        config: EngineConfig,
        base_dir: &Path,
        connector: Arc<dyn Connector>,
    ) -> anyhow::Result<Self> {
        let providers_path = config.providers_path(base_dir);
        let providers = load_providers_config(&providers_path)
            .with_context(|| format!("loading providers from {}", providers_path.display()))?;
        let registry = Arc::new(ProviderRegistry::new(providers));

        let data_dir = config.data_dir(base_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let db_path = data_dir.join(DATABASE_FILE).to_string_lossy().into_owned();

        let cache = if config.providers.schema_cache {
            Some(Arc::new(
                ToolSchemaCache::open(&db_path).context("opening tool schema cache")?,
            ))
        } else {
            None
        };
        let database = Arc::new(AgentDatabase::open(&db_path).context("opening transcript database")?);

        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            connector,
            cache,
            ManagerOptions {
                dynamic_provider: config.orchestration.dynamic_provider.clone(),
                call_timeout: std::time::Duration::from_millis(config.orchestration.call_timeout_ms),
            },
        ));

        let model = Arc::new(
            OllamaClient::new(
                &config.model.base_url,
                config.model.connect_timeout(),
                config.model.stream_timeout(),
            )
            .context("building model client")?,
        );

        let sessions = Arc::new(StreamRegistry::new());
        let model_stream: Arc<dyn ModelStream> = model.clone();
        let invoker: Arc<dyn ToolInvoker> = manager.clone();
        let orchestrator = Orchestrator::new(
            model_stream,
            invoker,
            Arc::clone(&sessions),
            OrchestratorConfig {
                max_cycles: config.orchestration.max_cycles,
                identity: config.orchestration.identity.clone(),
            },
        )
        .with_database(database);

        let composer: Option<Arc<dyn PromptComposer>> = if config.orchestration.compose_system_prompt {
            Some(Arc::new(ToolListComposer))
        } else {
            None
        };

        tracing::info!(
            model = %config.model.name,
            base_url = %config.model.base_url,
            providers = registry.len(),
            data_dir = %data_dir.display(),
            "engine ready"
        );

        Ok(Self {
            config,
            manager,
            model,
            sessions,
            orchestrator: Arc::new(orchestrator),
            composer,
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace (or remove) the system-prompt composer.
    pub fn with_composer(mut self, composer: Option<Arc<dyn PromptComposer>>) -> Self {
        self.composer = composer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<StreamRegistry> {
        &self.sessions
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    // ─── Streams ─────────────────────────────────────────────────────────

    /// Start a stream on its own task.
    ///
    /// A missing `channel_id` gets a fresh UUID. Reusing the id of an active
    /// stream cancels that stream. The channel is registered before this
    /// returns, so [`cancel_stream`](Self::cancel_stream) also interrupts the
    /// tool-catalog step, including a provider that is still connecting.
    pub fn stream_chat(
        &self,
        channel_id: Option<String>,
        history: Vec<ChatMessage>,
        sink: Arc<dyn OutputSink>,
    ) -> StreamHandle {
        let channel_id = channel_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let request = StreamRequest {
            channel_id: channel_id.clone(),
            model: self.config.model.name.clone(),
            history,
            options: self.config.model.chat_options(),
        };

        let cancel = self.sessions.register(&channel_id);
        let orchestrator = Arc::clone(&self.orchestrator);
        let manager = Arc::clone(&self.manager);
        let composer = self.composer.clone();
        let identity = self.config.orchestration.identity.clone();

        let task = tokio::spawn(async move {
            let mut request = request;
            if let Some(composer) = composer {
                // On cancel the orchestrator sees the cancelled token and
                // ends the stream before opening the model.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!(channel_id = %request.channel_id, "stream cancelled while preparing");
                    }
                    tools = manager.tool_catalog(&identity) => {
                        prepare_history(
                            &mut request.history,
                            composer.as_ref(),
                            manager.registry().all_configs(),
                            &tools,
                        );
                    }
                }
            }
            orchestrator.run_with_token(request, cancel, sink.as_ref()).await
        });

        StreamHandle { channel_id, task }
    }

    /// Cancel a stream. Returns whether it was active.
    pub fn cancel_stream(&self, channel_id: &str) -> bool {
        self.sessions.cancel(channel_id)
    }

    /// Start the background staleness sweep. Stops on [`shutdown`](Self::shutdown).
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        self.sessions.spawn_sweeper(
            self.config.sessions.sweep_interval(),
            self.config.sessions.stale_after(),
            self.shutdown.clone(),
        )
    }

    // ─── Providers ───────────────────────────────────────────────────────

    /// Connect every `autoStart` provider. Returns failures as `(name, error)`.
    pub async fn start_providers(&self) -> Vec<(String, String)> {
        let failures = self.manager.start_auto(&self.config.orchestration.identity).await;
        for (name, error) in &failures {
            tracing::warn!(provider = %name, error = %error, "auto-start provider failed");
        }
        failures
    }

    /// Tools currently offered to the model.
    pub async fn available_tools(&self) -> Vec<ToolDescriptor> {
        self.manager.tool_catalog(&self.config.orchestration.identity).await
    }

    /// Drop a provider's connections and cached schemas.
    pub async fn refresh_provider(&self, provider: &str) -> usize {
        self.manager.refresh(provider).await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        self.model.list_models().await
    }

    /// Cancel every stream, stop the sweeper, and close all providers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cancelled = self.sessions.cancel_all();
        self.manager.close_all().await;
        tracing::info!(cancelled_streams = cancelled, "engine shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::{StreamEvent, StreamStatus};
    use crate::mcp_client::lifecycle::ConnectedProvider;
    use crate::mcp_client::{McpError, ProviderConfig, TransportKind};
    use tokio::sync::mpsc;

    fn test_config(dir: &Path) -> EngineConfig {
        let yaml = format!(
            "model:\n  base_url: http://127.0.0.1:1\n  connect_timeout_secs: 1\ndata_dir: {}\n",
            dir.join("data").display()
        );
        EngineConfig::from_yaml_str(&yaml).unwrap()
    }

    fn write_providers(dir: &Path) {
        std::fs::write(
            dir.join("mcp_config.json"),
            r#"{"mcpServers": {"fs": {
                "command": "fs-server",
                "cachedTools": [{"name": "list_directory", "description": "List a directory"}]
            }}}"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_from_config_creates_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Engine::from_config(test_config(dir.path()), dir.path()).unwrap();
        assert!(dir.path().join("data").join(DATABASE_FILE).exists());
        assert_eq!(engine.config().orchestration.max_cycles, 20);
        assert!(engine.manager().registry().is_empty());
    }

    #[tokio::test]
    async fn test_available_tools_from_seeded_config() {
        let dir = tempfile::TempDir::new().unwrap();
        write_providers(dir.path());
        let engine = Engine::from_config(test_config(dir.path()), dir.path()).unwrap();

        let tools = engine.available_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].qualified_name(), "fs.list_directory");
        assert_eq!(engine.manager().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_stream() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Engine::from_config(test_config(dir.path()), dir.path()).unwrap();
        assert!(!engine.cancel_stream("nope"));
    }

    #[tokio::test]
    async fn test_stream_chat_reports_unreachable_model() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Engine::from_config(test_config(dir.path()), dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();

        let handle = engine.stream_chat(
            Some("chan-x".into()),
            vec![ChatMessage::user("hello")],
            Arc::new(tx),
        );
        assert_eq!(handle.channel_id, "chan-x");

        let result = handle.task.await.unwrap();
        assert!(matches!(result, Err(AgentError::StreamTransportError { .. })));

        let event = rx.recv().await.unwrap();
        assert!(event.done);
        assert!(event.content.contains("Error in tool processing"));
        assert!(!engine.sessions().is_active("chan-x"));
    }

    /// A provider that never finishes its handshake.
    struct HangingConnector;

    #[async_trait::async_trait]
    impl Connector for HangingConnector {
        async fn connect(
            &self,
            name: &str,
            _config: &ProviderConfig,
            _kind: &TransportKind,
        ) -> Result<ConnectedProvider, McpError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Err(McpError::InitFailed {
                name: name.to_string(),
                reason: "init timed out".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_while_provider_connecting() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("mcp_config.json"),
            r#"{"mcpServers": {"mcp-dynamic-tools": {"command": "dyn-server"}}}"#,
        )
        .unwrap();
        let mut config = test_config(dir.path());
        config.orchestration.compose_system_prompt = true;
        let engine =
            Engine::with_connector(config, dir.path(), Arc::new(HangingConnector)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();

        let handle = engine.stream_chat(
            Some("c".into()),
            vec![ChatMessage::user("hello")],
            Arc::new(tx),
        );
        assert!(engine.cancel_stream("c"));

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), handle.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, StreamStatus::Cancelled);
        assert_eq!(outcome.tool_calls, 0);
        assert!(outcome.output.is_empty());

        assert_eq!(rx.recv().await, Some(StreamEvent::done("")));
        assert_eq!(rx.recv().await, None);
        assert!(!engine.sessions().is_active("c"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeper() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Engine::from_config(test_config(dir.path()), dir.path()).unwrap();
        let sweeper = engine.start_sweeper();
        engine.shutdown().await;
        tokio::time::timeout(std::time::Duration::from_secs(2), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}
