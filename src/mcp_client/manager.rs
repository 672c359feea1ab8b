//! Provider Connection Manager.
//!
//! Lazily establishes one live connection per `(provider, identity)` key and
//! keeps it for reuse across sessions. First use of a key is single-flight:
//! concurrent callers wait on the same per-key async mutex, so exactly one
//! connection attempt runs. A failed attempt is remembered (with its error)
//! and not retried until [`ConnectionManager::refresh`].
//!
//! Tool invocation never fails from the caller's point of view: every error is
//! translated into a remediation string by [`super::remediation`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use super::errors::McpError;
use super::lifecycle::{connect_provider, list_tools, ConnectTimeouts, ConnectedProvider};
use super::normalize::{is_error_result, normalize};
use super::registry::{infer_transport, ProviderRegistry};
use super::remediation::{remediate_error, remediate_message, FailedCall};
use super::schema_cache::ToolSchemaCache;
use super::transport::{extract_result, McpTransport};
use super::types::{ProviderConfig, ToolDescriptor, TransportKind};

/// Default provider for tool names without a `provider.` prefix.
pub const DEFAULT_DYNAMIC_PROVIDER: &str = "mcp-dynamic-tools";

/// Default timeout for one `tools/call` round trip.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;

// ─── Connector ───────────────────────────────────────────────────────────────

/// Establishes a connection to a provider.
///
/// The production implementation launches or reaches the provider and runs
/// the handshake; tests substitute an in-process fake.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &ProviderConfig,
        kind: &TransportKind,
    ) -> Result<ConnectedProvider, McpError>;
}

/// Connector that spawns stdio subprocesses or opens SSE streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessConnector {
    pub timeouts: ConnectTimeouts,
}

#[async_trait::async_trait]
impl Connector for ProcessConnector {
    async fn connect(
        &self,
        name: &str,
        config: &ProviderConfig,
        kind: &TransportKind,
    ) -> Result<ConnectedProvider, McpError> {
        connect_provider(name, config, kind, self.timeouts).await
    }
}

// ─── ProviderConnection ──────────────────────────────────────────────────────

/// The outcome of connecting one `(provider, identity)` key.
///
/// Immutable once stored; rediscovery swaps in a new value. A failed attempt
/// has no live handle, no tools, and a `last_error`.
pub struct ProviderConnection {
    pub provider_name: String,
    pub identity: String,
    pub transport_kind: TransportKind,
    pub discovered_tools: Vec<ToolDescriptor>,
    pub last_error: Option<String>,
    live_handle: Option<Arc<dyn McpTransport>>,
}

impl ProviderConnection {
    /// Whether a live transport exists.
    pub fn is_live(&self) -> bool {
        self.live_handle.is_some()
    }

    fn transport(&self) -> Result<&Arc<dyn McpTransport>, McpError> {
        self.live_handle.as_ref().ok_or_else(|| McpError::NotConnected {
            provider: self.provider_name.clone(),
            identity: self.identity.clone(),
            reason: self
                .last_error
                .clone()
                .unwrap_or_else(|| "no live connection".into()),
        })
    }
}

impl std::fmt::Debug for ProviderConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConnection")
            .field("provider_name", &self.provider_name)
            .field("identity", &self.identity)
            .field("transport_kind", &self.transport_kind)
            .field("tools", &self.discovered_tools.len())
            .field("last_error", &self.last_error)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Result of one tool invocation as seen by the orchestration loop.
#[derive(Debug)]
pub struct ToolCallOutcome {
    /// Display text: the normalized result or a remediation message.
    pub text: String,
    /// The call failed at any layer (connection, transport, or tool).
    pub is_error: bool,
    /// Why no result came back. `None` for results the tool itself flagged
    /// with `isError`.
    pub error: Option<McpError>,
    pub elapsed_ms: u64,
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

type Key = (String, String);
type Slot = Arc<tokio::sync::Mutex<Option<Arc<ProviderConnection>>>>;

/// Tunables for the connection manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub dynamic_provider: String,
    pub call_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            dynamic_provider: DEFAULT_DYNAMIC_PROVIDER.to_string(),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
        }
    }
}

/// Owns every live provider connection.
pub struct ConnectionManager {
    registry: Arc<ProviderRegistry>,
    connector: Arc<dyn Connector>,
    cache: Option<Arc<ToolSchemaCache>>,
    options: ManagerOptions,
    slots: Mutex<HashMap<Key, Slot>>,
    transports: Mutex<HashMap<String, TransportKind>>,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        connector: Arc<dyn Connector>,
        cache: Option<Arc<ToolSchemaCache>>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            registry,
            connector,
            cache,
            options,
            slots: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Provider used for tool names without a `provider.` prefix.
    pub fn dynamic_provider(&self) -> &str {
        &self.options.dynamic_provider
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Get (or establish) the connection for a key.
    ///
    /// The returned connection may be a recorded failure; check
    /// [`ProviderConnection::is_live`].
    pub async fn ensure_connected(
        &self,
        provider: &str,
        identity: &str,
    ) -> Result<Arc<ProviderConnection>, McpError> {
        let config = self
            .registry
            .get_config(provider)
            .ok_or_else(|| McpError::UnknownProvider {
                name: provider.to_string(),
            })?;

        let slot = self.slot(provider, identity);
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(Arc::clone(existing));
        }

        let kind = self.transport_kind(provider, config);
        tracing::info!(
            provider = provider,
            identity = identity,
            transport = kind.label(),
            "connecting to provider"
        );

        let connection = match self.connector.connect(provider, config, &kind).await {
            Ok(ConnectedProvider { transport, tools }) => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.store(provider, &tools) {
                        tracing::warn!(provider = provider, error = %e, "failed to cache tool schemas");
                    }
                }
                ProviderConnection {
                    provider_name: provider.to_string(),
                    identity: identity.to_string(),
                    transport_kind: kind,
                    discovered_tools: tools,
                    last_error: None,
                    live_handle: Some(transport),
                }
            }
            Err(e) => {
                tracing::error!(
                    provider = provider,
                    identity = identity,
                    error = %e,
                    "provider connection failed"
                );
                ProviderConnection {
                    provider_name: provider.to_string(),
                    identity: identity.to_string(),
                    transport_kind: kind,
                    discovered_tools: Vec::new(),
                    last_error: Some(e.to_string()),
                    live_handle: None,
                }
            }
        };

        let connection = Arc::new(connection);
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Call a tool and return display text. Never fails.
    pub async fn invoke(
        &self,
        provider: &str,
        tool: &str,
        arguments: &Map<String, Value>,
        identity: &str,
    ) -> String {
        self.invoke_detailed(provider, tool, arguments, identity)
            .await
            .text
    }

    /// Like [`invoke`](Self::invoke) but also reports failure and timing.
    pub async fn invoke_detailed(
        &self,
        provider: &str,
        tool: &str,
        arguments: &Map<String, Value>,
        identity: &str,
    ) -> ToolCallOutcome {
        let start = Instant::now();
        let call = FailedCall {
            provider,
            tool,
            arguments,
        };

        let (text, is_error, error) = match self.call_tool(provider, tool, arguments, identity).await {
            Ok(value) => {
                let text = normalize(&value).into_display();
                if is_error_result(&value) {
                    (remediate_message(call, &text), true, None)
                } else {
                    (text, false, None)
                }
            }
            Err(e) => {
                tracing::warn!(
                    provider = provider,
                    tool = tool,
                    error = %e,
                    "tool invocation failed"
                );
                (remediate_error(call, &e), true, Some(e))
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            provider = provider,
            tool = tool,
            is_error,
            elapsed_ms,
            result_len = text.len(),
            "tool invocation finished"
        );
        ToolCallOutcome {
            text,
            is_error,
            error,
            elapsed_ms,
        }
    }

    async fn call_tool(
        &self,
        provider: &str,
        tool: &str,
        arguments: &Map<String, Value>,
        identity: &str,
    ) -> Result<Value, McpError> {
        let connection = self.ensure_connected(provider, identity).await?;
        let transport = connection.transport()?;

        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });
        let timeout = self.options.call_timeout;
        let response = tokio::time::timeout(timeout, transport.request("tools/call", Some(params)))
            .await
            .map_err(|_| McpError::Timeout {
                tool: format!("{provider}.{tool}"),
                timeout_ms: timeout.as_millis() as u64,
            })??;

        extract_result(response)
    }

    /// Forget every connection and cached schema for a provider.
    ///
    /// Live transports are closed. Returns how many identities were dropped.
    pub async fn refresh(&self, provider: &str) -> usize {
        let removed: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<Key> = slots.keys().filter(|(p, _)| p == provider).cloned().collect();
            keys.iter().filter_map(|k| slots.remove(k)).collect()
        };

        for slot in &removed {
            close_slot(slot).await;
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate(provider) {
                tracing::warn!(provider = provider, error = %e, "failed to invalidate schema cache");
            }
        }

        tracing::info!(provider = provider, identities = removed.len(), "provider refreshed");
        removed.len()
    }

    /// Close every connection. Individual close errors are logged and swallowed.
    pub async fn close_all(&self) {
        let drained: Vec<(Key, Slot)> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().collect()
        };

        let count = drained.len();
        for (_, slot) in drained {
            close_slot(&slot).await;
        }
        tracing::info!(connections = count, "all provider connections closed");
    }

    /// Connect every `autoStart` provider for an identity, concurrently.
    ///
    /// Returns the providers that failed, with their errors.
    pub async fn start_auto(&self, identity: &str) -> Vec<(String, String)> {
        let names = self.registry.auto_start_names();
        let attempts = names.iter().map(|name| self.ensure_connected(name, identity));
        let results = futures::future::join_all(attempts).await;

        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| match result {
                Ok(conn) => conn.last_error.clone().map(|e| (name, e)),
                Err(e) => Some((name, e.to_string())),
            })
            .collect()
    }

    /// Re-run `tools/list` on the existing connection for a key.
    ///
    /// The live transport is kept; only the stored tool list and the schema
    /// cache are replaced. A recorded failure is returned unchanged, and a
    /// failed listing keeps the previous tools.
    pub async fn rediscover(
        &self,
        provider: &str,
        identity: &str,
    ) -> Result<Arc<ProviderConnection>, McpError> {
        let connection = self.ensure_connected(provider, identity).await?;
        let Some(transport) = connection.live_handle.clone() else {
            return Ok(connection);
        };

        let tools = match list_tools(provider, transport.as_ref(), self.options.call_timeout).await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(provider = provider, error = %e, "tool rediscovery failed");
                return Ok(connection);
            }
        };

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(provider, &tools) {
                tracing::warn!(provider = provider, error = %e, "failed to cache tool schemas");
            }
        }

        let updated = Arc::new(ProviderConnection {
            provider_name: connection.provider_name.clone(),
            identity: connection.identity.clone(),
            transport_kind: connection.transport_kind.clone(),
            discovered_tools: tools,
            last_error: None,
            live_handle: Some(transport),
        });

        let slot = self.slot(provider, identity);
        let mut guard = slot.lock().await;
        // A refresh in between dropped the key; the listing is stale.
        if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, &connection)) {
            *guard = Some(Arc::clone(&updated));
        }
        tracing::debug!(
            provider = provider,
            tools = updated.discovered_tools.len(),
            "provider tools rediscovered"
        );
        Ok(updated)
    }

    /// Tools for prompt building, one provider at a time.
    ///
    /// Sources in order: live discovery, persisted cache, config `cachedTools`.
    /// Only providers that are `autoStart`, already connected, or the dynamic
    /// provider are connected here. The dynamic provider's tool list is
    /// re-read on its existing connection so newly created tools show up.
    pub async fn tool_catalog(&self, identity: &str) -> Vec<ToolDescriptor> {
        let mut catalog = Vec::new();

        for name in self.registry.names() {
            let is_dynamic = name == self.options.dynamic_provider;
            let should_connect = is_dynamic
                || self.has_slot(&name, identity)
                || self.registry.get_config(&name).is_some_and(|c| c.auto_start);

            let live = if is_dynamic {
                self.rediscover(&name, identity)
                    .await
                    .map(|conn| conn.discovered_tools.clone())
                    .unwrap_or_default()
            } else if should_connect {
                self.ensure_connected(&name, identity)
                    .await
                    .map(|conn| conn.discovered_tools.clone())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };

            let tools = if !live.is_empty() {
                live
            } else {
                let cached = self
                    .cache
                    .as_ref()
                    .and_then(|c| match c.load(&name) {
                        Ok(tools) => tools,
                        Err(e) => {
                            tracing::warn!(provider = %name, error = %e, "schema cache read failed");
                            None
                        }
                    })
                    .unwrap_or_default();
                if cached.is_empty() {
                    self.registry.seeded_tools(&name)
                } else {
                    cached
                }
            };

            catalog.extend(tools);
        }

        catalog
    }

    /// Number of stored connections (live or failed).
    pub fn connection_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn has_slot(&self, provider: &str, identity: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(provider.to_string(), identity.to_string()))
    }

    fn slot(&self, provider: &str, identity: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry((provider.to_string(), identity.to_string()))
                .or_default(),
        )
    }

    /// Transport decision, made once per provider.
    fn transport_kind(&self, provider: &str, config: &ProviderConfig) -> TransportKind {
        let mut transports = self.transports.lock().unwrap_or_else(|e| e.into_inner());
        transports
            .entry(provider.to_string())
            .or_insert_with(|| infer_transport(config))
            .clone()
    }
}

async fn close_slot(slot: &Slot) {
    let connection = slot.lock().await.take();
    let Some(connection) = connection else {
        return;
    };
    if let Some(transport) = connection.live_handle.as_ref() {
        if let Err(e) = transport.close().await {
            tracing::warn!(
                provider = %connection.provider_name,
                identity = %connection.identity,
                error = %e,
                "error closing provider connection"
            );
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::{JsonRpcError, JsonRpcResponse, ProvidersConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process provider: echoes the tool name, fails on `missing_file`.
    struct FakeTransport {
        closed: Arc<AtomicUsize>,
        listed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl McpTransport for FakeTransport {
        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
        ) -> Result<JsonRpcResponse, McpError> {
            if method == "tools/list" {
                self.listed.fetch_add(1, Ordering::SeqCst);
                return Ok(JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: 1,
                    result: Some(serde_json::json!({"tools": [
                        {"name": "list_directory", "description": "List a directory"},
                        {"name": "created_later", "description": "Made after connect"}
                    ]})),
                    error: None,
                });
            }
            let params = params.unwrap_or(Value::Null);
            let tool = params["name"].as_str().unwrap_or_default().to_string();
            let response = match tool.as_str() {
                "missing_file" => JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: 1,
                    result: None,
                    error: Some(JsonRpcError {
                        code: -32603,
                        message: "ENOENT: no such file or directory".into(),
                        data: None,
                    }),
                },
                "flagged" => JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: 1,
                    result: Some(serde_json::json!({
                        "isError": true,
                        "content": [{"type": "text", "text": "permission denied"}]
                    })),
                    error: None,
                },
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    return Err(McpError::TransportError {
                        provider: "fs".into(),
                        reason: "unreachable".into(),
                    });
                }
                _ => JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: 1,
                    result: Some(serde_json::json!({
                        "content": [{"type": "text", "text": format!("ran {tool} with {}", params["arguments"])}]
                    })),
                    error: None,
                },
            };
            Ok(response)
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeConnector {
        connects: AtomicUsize,
        closed: Arc<AtomicUsize>,
        listed: Arc<AtomicUsize>,
        fail: bool,
        delay: Duration,
    }

    impl FakeConnector {
        fn new(fail: bool) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                listed: Arc::new(AtomicUsize::new(0)),
                fail,
                delay: Duration::from_millis(20),
            }
        }
    }

    #[async_trait::async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            name: &str,
            _config: &ProviderConfig,
            _kind: &TransportKind,
        ) -> Result<ConnectedProvider, McpError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(McpError::InitFailed {
                    name: name.to_string(),
                    reason: "ping timed out".into(),
                });
            }
            let transport: Arc<dyn McpTransport> = Arc::new(FakeTransport {
                closed: Arc::clone(&self.closed),
                listed: Arc::clone(&self.listed),
            });
            Ok(ConnectedProvider {
                transport,
                tools: vec![ToolDescriptor {
                    provider: name.to_string(),
                    name: "list_directory".into(),
                    description: "List a directory".into(),
                    parameter_schema: Map::new(),
                }],
            })
        }
    }

    fn registry() -> Arc<ProviderRegistry> {
        let cfg: ProvidersConfig = serde_json::from_value(serde_json::json!({
            "mcpServers": {
                "fs": {"command": "fs-server"},
                "seeded": {"command": "seeded-server", "cachedTools": [{"name": "seeded_tool"}]},
                "mcp-dynamic-tools": {"command": "dyn-server"}
            }
        }))
        .unwrap();
        Arc::new(ProviderRegistry::new(cfg))
    }

    fn manager(connector: Arc<FakeConnector>) -> ConnectionManager {
        ConnectionManager::new(registry(), connector, None, ManagerOptions::default())
    }

    #[tokio::test]
    async fn test_concurrent_first_use_connects_once() {
        let connector = Arc::new(FakeConnector::new(false));
        let mgr = manager(Arc::clone(&connector));

        let attempts = (0..16).map(|_| mgr.ensure_connected("fs", "user"));
        let results = futures::future::join_all(attempts).await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for r in &results {
            assert!(Arc::ptr_eq(first, r.as_ref().unwrap()));
        }
        assert_eq!(mgr.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_identities_are_separate_keys() {
        let connector = Arc::new(FakeConnector::new(false));
        let mgr = manager(Arc::clone(&connector));

        mgr.ensure_connected("fs", "alice").await.unwrap();
        mgr.ensure_connected("fs", "bob").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let mgr = manager(Arc::new(FakeConnector::new(false)));
        assert!(matches!(
            mgr.ensure_connected("ghost", "user").await,
            Err(McpError::UnknownProvider { .. })
        ));

        let outcome = mgr
            .invoke_detailed("ghost", "anything", &Map::new(), "user")
            .await;
        assert!(outcome.is_error);
        assert!(outcome.text.to_lowercase().contains("unknown provider"));
        assert!(matches!(outcome.error, Some(McpError::UnknownProvider { .. })));
    }

    #[tokio::test]
    async fn test_invoke_normalizes_result() {
        let mgr = manager(Arc::new(FakeConnector::new(false)));
        let mut args = Map::new();
        args.insert("path".into(), Value::String("/tmp".into()));

        let text = mgr.invoke("fs", "list_directory", &args, "user").await;
        assert_eq!(text, r#"ran list_directory with {"path":"/tmp"}"#);
    }

    #[tokio::test]
    async fn test_invoke_translates_server_error() {
        let mgr = manager(Arc::new(FakeConnector::new(false)));
        let mut args = Map::new();
        args.insert("path".into(), Value::String("/tmp/nope.txt".into()));

        let outcome = mgr.invoke_detailed("fs", "missing_file", &args, "user").await;
        assert!(outcome.is_error);
        assert!(outcome.text.starts_with("File not found: /tmp/nope.txt."));
    }

    #[tokio::test]
    async fn test_invoke_translates_flagged_result() {
        let mgr = manager(Arc::new(FakeConnector::new(false)));
        let outcome = mgr.invoke_detailed("fs", "flagged", &Map::new(), "user").await;
        assert!(outcome.is_error);
        assert!(outcome.error.is_none());
        assert!(outcome.text.starts_with("Permission denied"));
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let connector = Arc::new(FakeConnector::new(false));
        let mgr = ConnectionManager::new(
            registry(),
            connector,
            None,
            ManagerOptions {
                call_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let outcome = mgr.invoke_detailed("fs", "slow", &Map::new(), "user").await;
        assert!(outcome.is_error);
        assert!(outcome.text.starts_with("Error executing tool:"));
        assert!(outcome.text.contains("timed out"));
    }

    #[tokio::test]
    async fn test_failed_connection_not_retried_until_refresh() {
        let connector = Arc::new(FakeConnector::new(true));
        let mgr = manager(Arc::clone(&connector));

        let conn = mgr.ensure_connected("fs", "user").await.unwrap();
        assert!(!conn.is_live());
        assert!(conn.discovered_tools.is_empty());
        assert!(conn.last_error.as_deref().unwrap().contains("ping timed out"));

        let text = mgr.invoke("fs", "list_directory", &Map::new(), "user").await;
        assert!(text.contains("not connected"));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        assert_eq!(mgr.refresh("fs").await, 1);
        mgr.ensure_connected("fs", "user").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_closes_every_identity_and_invalidates_cache() {
        let connector = Arc::new(FakeConnector::new(false));
        let cache = Arc::new(ToolSchemaCache::open(":memory:").unwrap());
        let mgr = ConnectionManager::new(
            registry(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Some(Arc::clone(&cache)),
            ManagerOptions::default(),
        );

        mgr.ensure_connected("fs", "alice").await.unwrap();
        mgr.ensure_connected("fs", "bob").await.unwrap();
        assert!(cache.load("fs").unwrap().is_some());

        assert_eq!(mgr.refresh("fs").await, 2);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 2);
        assert!(cache.load("fs").unwrap().is_none());
        assert_eq!(mgr.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all() {
        let connector = Arc::new(FakeConnector::new(false));
        let mgr = manager(Arc::clone(&connector));
        mgr.ensure_connected("fs", "user").await.unwrap();
        mgr.ensure_connected("seeded", "user").await.unwrap();

        mgr.close_all().await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_tool_catalog_sources() {
        let connector = Arc::new(FakeConnector::new(false));
        let cache = Arc::new(ToolSchemaCache::open(":memory:").unwrap());
        cache
            .store(
                "fs",
                &[ToolDescriptor {
                    provider: "fs".into(),
                    name: "cached_read".into(),
                    description: "from cache".into(),
                    parameter_schema: Map::new(),
                }],
            )
            .unwrap();
        let mgr = ConnectionManager::new(
            registry(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Some(cache),
            ManagerOptions::default(),
        );

        let names: Vec<String> = mgr
            .tool_catalog("user")
            .await
            .iter()
            .map(|t| t.qualified_name())
            .collect();

        assert_eq!(
            names,
            vec![
                "fs.cached_read",
                "mcp-dynamic-tools.list_directory",
                "mcp-dynamic-tools.created_later",
                "seeded.seeded_tool",
            ]
        );
        // Only the dynamic provider was connected.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tool_catalog_reuses_dynamic_connection() {
        let connector = Arc::new(FakeConnector::new(false));
        let cache = Arc::new(ToolSchemaCache::open(":memory:").unwrap());
        let mgr = ConnectionManager::new(
            registry(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Some(Arc::clone(&cache)),
            ManagerOptions::default(),
        );

        let first = mgr.tool_catalog("user").await;
        let second = mgr.tool_catalog("user").await;
        assert_eq!(first, second);

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 0);
        assert_eq!(connector.listed.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.connection_count(), 1);

        let conn = mgr.ensure_connected("mcp-dynamic-tools", "user").await.unwrap();
        assert!(conn.is_live());
        assert_eq!(conn.discovered_tools.len(), 2);
        assert_eq!(cache.load("mcp-dynamic-tools").unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rediscover_keeps_recorded_failure() {
        let connector = Arc::new(FakeConnector::new(true));
        let mgr = manager(Arc::clone(&connector));

        let conn = mgr.rediscover("mcp-dynamic-tools", "user").await.unwrap();
        assert!(!conn.is_live());
        mgr.rediscover("mcp-dynamic-tools", "user").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.listed.load(Ordering::SeqCst), 0);
    }
}
