//! Ollama inference client.
//!
//! Opens streaming chat requests against a local Ollama server and hands
//! back a token stream. The orchestration loop only sees the [`ModelStream`]
//! trait, so tests substitute scripted streams.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;

use super::errors::InferenceError;
use super::streaming::parse_ndjson_stream;
use super::types::{ChatMessage, ChatOptions, ChatRequest, ModelInfo, ModelList};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default TCP connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for non-streaming calls (`/api/tags`).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default total timeout for one streaming response.
///
/// Local models can take a long time before the first token when the
/// context is large.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

// ─── ModelStream ─────────────────────────────────────────────────────────────

/// Content tokens from one model response, in order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

/// Something that can open a streaming chat for a conversation.
///
/// Dropping the returned stream aborts the underlying request.
#[async_trait::async_trait]
pub trait ModelStream: Send + Sync {
    async fn open_stream(
        &self,
        model: &str,
        history: &[ChatMessage],
        options: &ChatOptions,
        cancel: CancellationToken,
    ) -> Result<TokenStream, InferenceError>;
}

// ─── OllamaClient ────────────────────────────────────────────────────────────

/// HTTP client for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    /// HTTP client for short requests.
    http: HttpClient,
    /// HTTP client for streaming chat (long total timeout).
    http_stream: HttpClient,
    stream_timeout: Duration,
}

impl OllamaClient {
    /// Create a client. Does NOT check connectivity; that happens on the
    /// first request.
    pub fn new(
        base_url: &str,
        connect_timeout: Duration,
        stream_timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let base_url = base_url.trim_end_matches('/').to_string();

        let http = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .timeout(stream_timeout)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url,
            http,
            http_stream,
            stream_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List installed models (`GET /api/tags`).
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e, REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse model list: {e}"),
            })?;
        Ok(list.models)
    }
}

#[async_trait::async_trait]
impl ModelStream for OllamaClient {
    async fn open_stream(
        &self,
        model: &str,
        history: &[ChatMessage],
        options: &ChatOptions,
        cancel: CancellationToken,
    ) -> Result<TokenStream, InferenceError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model,
            messages: history,
            stream: true,
            options: *options,
        };

        // Log the request metadata (not the full body, it can be huge)
        tracing::info!(
            url = %url,
            model = %model,
            message_count = history.len(),
            "=== LLM REQUEST ==="
        );
        if let Some(last) = history.last() {
            tracing::debug!(role = ?last.role, content = %last.content, "last history message");
        }

        let send = self.http_stream.post(&url).json(&body).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(InferenceError::StreamError {
                    reason: "request cancelled".into(),
                });
            }
            result = send => result.map_err(|e| map_send_error(&url, e, self.stream_timeout))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 && body.contains("not found") {
                return Err(InferenceError::ModelNotFound {
                    model: model.to_string(),
                });
            }
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(parse_ndjson_stream(response.bytes_stream())))
    }
}

fn map_send_error(url: &str, e: reqwest::Error, timeout: Duration) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout {
            duration_secs: timeout.as_secs(),
        }
    } else {
        InferenceError::ConnectionFailed {
            endpoint: url.to_string(),
            reason: e.to_string(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
