//! Provider process lifecycle: spawn, handshake, liveness check, discovery.
//!
//! A stdio provider runs as a separate OS process speaking JSON-RPC over its
//! stdio; an SSE provider is reached over HTTP. Either way the connection is
//! only handed out after `initialize`, a bounded `ping`, and `tools/list`.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::{ChildStderr, Command};

use super::errors::McpError;
use super::transport::{extract_result, McpTransport, SseTransport, StdioTransport};
use super::types::{
    error_codes, ListToolsResult, ProviderConfig, ToolDescriptor, TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol revision announced in `initialize`.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Maximum stderr captured into an init failure message.
const STDERR_CAPTURE_LIMIT: usize = 2000;

/// Timeouts applied while bringing a provider up.
#[derive(Debug, Clone, Copy)]
pub struct ConnectTimeouts {
    /// Bound on `initialize` and `tools/list`.
    pub init: Duration,
    /// Bound on the liveness `ping`.
    pub ping: Duration,
}

impl Default for ConnectTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(30),
            ping: Duration::from_secs(5),
        }
    }
}

/// A provider that completed the handshake and listed its tools.
pub struct ConnectedProvider {
    pub transport: Arc<dyn McpTransport>,
    pub tools: Vec<ToolDescriptor>,
}

// ─── Connecting ──────────────────────────────────────────────────────────────

/// Launch or reach a provider and run the full handshake.
///
/// On any failure after the transport exists, the transport is closed before
/// the error is returned, so no half-started subprocess outlives the attempt.
pub async fn connect_provider(
    name: &str,
    config: &ProviderConfig,
    kind: &TransportKind,
    timeouts: ConnectTimeouts,
) -> Result<ConnectedProvider, McpError> {
    let (transport, stderr): (Arc<dyn McpTransport>, Option<ChildStderr>) = match kind {
        TransportKind::Stdio => {
            let (stdio, stderr) = spawn_stdio(name, config)?;
            let transport: Arc<dyn McpTransport> = Arc::new(stdio);
            (transport, stderr)
        }
        TransportKind::Sse { url } => {
            let transport: Arc<dyn McpTransport> =
                Arc::new(SseTransport::connect(name, url).await?);
            (transport, None)
        }
    };

    match handshake(name, transport.as_ref(), timeouts).await {
        Ok(tools) => {
            tracing::info!(
                provider = name,
                transport = kind.label(),
                tools = tools.len(),
                "provider connected"
            );
            Ok(ConnectedProvider { transport, tools })
        }
        Err(e) => {
            if let Err(close_err) = transport.close().await {
                tracing::debug!(provider = name, error = %close_err, "closing failed provider");
            }
            let stderr_ctx = read_stderr_on_failure(stderr).await;
            if !stderr_ctx.is_empty() {
                tracing::warn!(
                    provider = name,
                    stderr = %stderr_ctx,
                    "provider stderr captured on failure"
                );
            }
            Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
            })
        }
    }
}

/// Spawn a stdio provider process with piped stdio.
fn spawn_stdio(
    name: &str,
    config: &ProviderConfig,
) -> Result<(StdioTransport, Option<ChildStderr>), McpError> {
    if config.command.trim().is_empty() {
        return Err(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "no command configured".into(),
        });
    }

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    cmd.env("MCP_ENABLED", "true");
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = config.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = child.stderr.take();

    Ok((StdioTransport::new(name, child, stdin, stdout), stderr))
}

/// `initialize` → `notifications/initialized` → `ping` → `tools/list`.
async fn handshake(
    name: &str,
    transport: &dyn McpTransport,
    timeouts: ConnectTimeouts,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": format!("toolstream-{name}"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = tokio::time::timeout(timeouts.init, transport.request("initialize", Some(params)))
        .await
        .map_err(|_| McpError::Timeout {
            tool: "initialize".into(),
            timeout_ms: timeouts.init.as_millis() as u64,
        })??;
    extract_result(response)?;

    transport.notify("notifications/initialized", None).await?;

    ping(transport, timeouts.ping).await?;

    list_tools(name, transport, timeouts.init).await
}

/// Run `tools/list` on an established transport.
///
/// Also used to pick up tools a provider created after its handshake.
pub async fn list_tools(
    name: &str,
    transport: &dyn McpTransport,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let response = tokio::time::timeout(timeout, transport.request("tools/list", None))
        .await
        .map_err(|_| McpError::Timeout {
            tool: "tools/list".into(),
            timeout_ms: timeout.as_millis() as u64,
        })??;
    let listed: ListToolsResult =
        serde_json::from_value(extract_result(response)?).map_err(|e| McpError::InitFailed {
            name: name.to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;

    Ok(listed
        .tools
        .into_iter()
        .map(|def| ToolDescriptor::from_definition(name, def))
        .collect())
}

/// Bounded liveness check.
///
/// A provider that answers `ping` with "method not found" is still alive.
pub async fn ping(transport: &dyn McpTransport, timeout: Duration) -> Result<(), McpError> {
    let response = tokio::time::timeout(timeout, transport.request("ping", None))
        .await
        .map_err(|_| McpError::Timeout {
            tool: "ping".into(),
            timeout_ms: timeout.as_millis() as u64,
        })??;

    match extract_result(response) {
        Ok(_) => Ok(()),
        Err(McpError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read any available stderr output from a failed provider process.
///
/// Uses a short timeout so an idle stderr never blocks error reporting.
async fn read_stderr_on_failure(stderr_handle: Option<ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > STDERR_CAPTURE_LIMIT {
                let mut cut = STDERR_CAPTURE_LIMIT;
                while !buf.is_char_boundary(cut) {
                    cut -= 1;
                }
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
