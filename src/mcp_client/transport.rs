//! JSON-RPC transports for tool providers.
//!
//! Two transports share the [`McpTransport`] trait:
//! - [`StdioTransport`]: line-delimited JSON over a child process's stdin/stdout
//! - [`SseTransport`]: events from a server-sent-events stream, requests via POST
//!
//! Both serialize request/response round trips per connection, so sessions
//! sharing a connection never read each other's responses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A bidirectional JSON-RPC channel to one provider.
#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the response with the matching `id`.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>)
        -> Result<(), McpError>;

    /// Tear the channel down. Safe to call more than once.
    async fn close(&self) -> Result<(), McpError>;
}

fn encode_line<T: serde::Serialize>(provider: &str, msg: &T) -> Result<String, McpError> {
    let mut json = serde_json::to_string(msg).map_err(|e| McpError::TransportError {
        provider: provider.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');
    Ok(json)
}

fn notification(method: &str, params: Option<serde_json::Value>) -> serde_json::Value {
    match params {
        Some(params) => serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        None => serde_json::json!({ "jsonrpc": "2.0", "method": method }),
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

struct StdioPipes {
    /// `None` once [`McpTransport::close`] has sent EOF.
    writer: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
}

/// JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    provider: String,
    pipes: Mutex<StdioPipes>,
    process: Mutex<Child>,
}

impl StdioTransport {
    /// Create a transport that owns the child process and its pipes.
    pub fn new(provider: &str, process: Child, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            provider: provider.to_string(),
            pipes: Mutex::new(StdioPipes {
                writer: Some(stdin),
                reader: BufReader::new(stdout),
            }),
            process: Mutex::new(process),
        }
    }

    async fn kill(&self, process: &mut Child) -> Result<(), McpError> {
        process
            .kill()
            .await
            .map_err(|e| self.transport_error(format!("failed to kill provider: {e}")))
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            provider: self.provider.clone(),
            reason,
        }
    }

    async fn write_line(&self, pipes: &mut StdioPipes, line: &str) -> Result<(), McpError> {
        let writer = pipes
            .writer
            .as_mut()
            .ok_or_else(|| self.transport_error("stdin already closed".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let line = encode_line(&self.provider, &JsonRpcRequest::new(id, method, params))?;

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes, &line).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = pipes
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error(
                    "provider stdout closed (process may have exited)".into(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            // Log output, notifications and stale responses are skipped.
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(_) | Err(_) => continue,
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let line = encode_line(&self.provider, &notification(method, params))?;
        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes, &line).await
    }

    /// Close stdin, give the provider [`SHUTDOWN_TIMEOUT`] to exit on EOF,
    /// then kill it.
    async fn close(&self) -> Result<(), McpError> {
        let writer = self.pipes.lock().await.writer.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(provider = %self.provider, error = %e, "closing provider stdin failed");
            }
        }

        let mut process = self.process.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, process.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!(provider = %self.provider, error = %e, "waiting for provider exit failed");
                self.kill(&mut process).await
            }
            Err(_) => {
                tracing::debug!(provider = %self.provider, "provider ignored EOF, killing");
                self.kill(&mut process).await
            }
        }
    }
}

// ─── SSE ─────────────────────────────────────────────────────────────────────

/// Message forwarded from the SSE reader task.
#[derive(Debug)]
enum SseMessage {
    /// The POST endpoint announced by the server (`event: endpoint`).
    Endpoint(String),
    /// A JSON-RPC message (`event: message`).
    Message(serde_json::Value),
}

struct SseState {
    receiver: mpsc::UnboundedReceiver<SseMessage>,
    endpoint_url: Option<String>,
}

/// JSON-RPC transport over server-sent events.
///
/// Responses arrive on the event stream; requests are POSTed to the endpoint
/// the server announces in its first `endpoint` event.
pub struct SseTransport {
    provider: String,
    client: reqwest::Client,
    base_url: String,
    state: Mutex<SseState>,
    reader_task: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and start the background reader.
    pub async fn connect(provider: &str, url: &str) -> Result<Self, McpError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| McpError::TransportError {
                provider: provider.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let response = client
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::TransportError {
                provider: provider.to_string(),
                reason: format!("failed to connect to {url}: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(McpError::TransportError {
                provider: provider.to_string(),
                reason: format!("SSE endpoint {url} returned HTTP {}", response.status()),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let name = provider.to_string();
        let reader_task = tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(provider = %name, error = %e, "SSE stream read error");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));

                while let Some(pos) = buffer.find("\n\n") {
                    let block = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    if let Some(msg) = parse_sse_event(&block) {
                        if tx.send(msg).is_err() {
                            return;
                        }
                    }
                }
            }
            tracing::debug!(provider = %name, "SSE stream ended");
        });

        Ok(Self {
            provider: provider.to_string(),
            client,
            base_url: url.to_string(),
            state: Mutex::new(SseState {
                receiver: rx,
                endpoint_url: None,
            }),
            reader_task,
        })
    }

    async fn kill(&self, process: &mut Child) -> Result<(), McpError> {
        process
            .kill()
            .await
            .map_err(|e| self.transport_error(format!("failed to kill provider: {e}")))
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            provider: self.provider.clone(),
            reason,
        }
    }

    /// Wait for the server's `endpoint` event if it has not arrived yet.
    async fn endpoint(&self, state: &mut SseState) -> Result<String, McpError> {
        while state.endpoint_url.is_none() {
            match state.receiver.recv().await {
                Some(SseMessage::Endpoint(raw)) => {
                    state.endpoint_url = Some(resolve_endpoint(&self.base_url, &raw)?);
                }
                Some(SseMessage::Message(_)) => continue,
                None => return Err(self.transport_error("SSE stream closed".into())),
            }
        }
        state
            .endpoint_url
            .clone()
            .ok_or_else(|| self.transport_error("SSE endpoint not announced".into()))
    }

    async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<(), McpError> {
        let response = self
            .client
            .post(endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("failed to POST message: {e}")))?;
        if !response.status().is_success() {
            return Err(self.transport_error(format!(
                "POST {endpoint} returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let mut state = self.state.lock().await;
        let endpoint = self.endpoint(&mut state).await?;
        self.post(&endpoint, &body).await?;

        loop {
            match state.receiver.recv().await {
                Some(SseMessage::Message(value)) => {
                    if let Ok(resp) = serde_json::from_value::<JsonRpcResponse>(value) {
                        if resp.id == id {
                            return Ok(resp);
                        }
                    }
                }
                Some(SseMessage::Endpoint(raw)) => {
                    state.endpoint_url = Some(resolve_endpoint(&self.base_url, &raw)?);
                }
                None => return Err(self.transport_error("SSE stream closed".into())),
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut state = self.state.lock().await;
        let endpoint = self.endpoint(&mut state).await?;
        self.post(&endpoint, &notification(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.reader_task.abort();
        Ok(())
    }
}

/// Parse one SSE event block into a transport message.
///
/// Unknown event types, comments, and non-JSON `message` payloads yield `None`.
fn parse_sse_event(block: &str) -> Option<SseMessage> {
    let mut event_type = "message";
    let mut data = String::new();

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = rest.trim();
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    match event_type {
        "endpoint" if !data.is_empty() => Some(SseMessage::Endpoint(data)),
        "message" => serde_json::from_str(&data).ok().map(SseMessage::Message),
        _ => None,
    }
}

/// Resolve a possibly relative endpoint path against the SSE url.
fn resolve_endpoint(base_url: &str, raw: &str) -> Result<String, McpError> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(raw.to_string());
    }
    let base = reqwest::Url::parse(base_url).map_err(|e| McpError::ConfigError {
        reason: format!("invalid SSE url '{base_url}': {e}"),
    })?;
    base.join(raw)
        .map(|u| u.to_string())
        .map_err(|e| McpError::ConfigError {
            reason: format!("invalid SSE endpoint '{raw}': {e}"),
        })
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
