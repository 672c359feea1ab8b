//! Orchestration loop.
//!
//! One call to [`Orchestrator::run`] drives a whole streamed answer:
//!
//! 1. open a model stream for the current history
//! 2. feed every token through the [`TokenClassifier`], forwarding pass-through
//!    text to the sink
//! 3. on a detected tool call: invoke it, splice the call and its result into
//!    the history, emit the result, and start the next cycle
//! 4. stop on natural completion, after `max_cycles` tool calls, on
//!    cancellation, or when the model stream fails
//!
//! The loop is iterative. Cancellation is raced against every token, every
//! stream open, and every tool invocation.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::classifier::{DetectedToolCall, TokenClass, TokenClassifier};
use super::database::{AgentDatabase, NewTranscriptEntry};
use super::errors::AgentError;
use super::prompts::{monitoring_prompt, original_message};
use super::sessions::StreamRegistry;
use crate::inference::{ChatMessage, ChatOptions, InferenceError, ModelStream};
use crate::mcp_client::{ConnectionManager, ToolCallOutcome};

/// Default bound on tool calls per stream.
pub const DEFAULT_MAX_CYCLES: u32 = 20;

// ─── Seams ───────────────────────────────────────────────────────────────────

/// One unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub content: String,
    pub done: bool,
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
        }
    }

    pub fn done(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: true,
        }
    }
}

/// Receives streamed output in order.
pub trait OutputSink: Send + Sync {
    /// Deliver one event. Returns `false` if the receiver is gone.
    fn emit(&self, event: StreamEvent) -> bool;
}

impl OutputSink for mpsc::UnboundedSender<StreamEvent> {
    fn emit(&self, event: StreamEvent) -> bool {
        mpsc::UnboundedSender::send(self, event).is_ok()
    }
}

/// Executes tool calls. Never fails: failures come back as text.
#[async_trait::async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke_tool(
        &self,
        provider: &str,
        tool: &str,
        arguments: &Map<String, Value>,
        identity: &str,
    ) -> ToolCallOutcome;

    /// Provider for tool names without a `provider.` prefix.
    fn dynamic_provider(&self) -> &str;
}

#[async_trait::async_trait]
impl ToolInvoker for ConnectionManager {
    async fn invoke_tool(
        &self,
        provider: &str,
        tool: &str,
        arguments: &Map<String, Value>,
        identity: &str,
    ) -> ToolCallOutcome {
        self.invoke_detailed(provider, tool, arguments, identity).await
    }

    fn dynamic_provider(&self) -> &str {
        ConnectionManager::dynamic_provider(self)
    }
}

// ─── Request / Outcome ───────────────────────────────────────────────────────

/// Everything needed to start one stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub channel_id: String,
    pub model: String,
    pub history: Vec<ChatMessage>,
    pub options: ChatOptions,
}

/// How a stream ended without a terminal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Completed,
    CycleLimitReached,
    Cancelled,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Completed => "completed",
            StreamStatus::CycleLimitReached => "cycle_limit_reached",
            StreamStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of a finished stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub status: StreamStatus,
    pub tool_calls: u32,
    /// The history including every spliced tool call and result.
    pub history: Vec<ChatMessage>,
    /// Everything emitted before the final event.
    pub output: String,
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_cycles: u32,
    /// Identity under which provider connections are made.
    pub identity: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_cycles: DEFAULT_MAX_CYCLES,
            identity: "user".to_string(),
        }
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// Per-stream mutable state, owned by [`Orchestrator::run`].
struct LoopState {
    channel_id: String,
    history: Vec<ChatMessage>,
    original_message: Option<String>,
    tool_calls: u32,
    output: String,
}

/// Drives model streams and tool calls for every session.
pub struct Orchestrator {
    model: Arc<dyn ModelStream>,
    tools: Arc<dyn ToolInvoker>,
    sessions: Arc<StreamRegistry>,
    database: Option<Arc<AgentDatabase>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelStream>,
        tools: Arc<dyn ToolInvoker>,
        sessions: Arc<StreamRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            model,
            tools,
            sessions,
            database: None,
            config,
        }
    }

    /// Record every tool call and stream outcome in `database`.
    pub fn with_database(mut self, database: Arc<AgentDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn sessions(&self) -> &Arc<StreamRegistry> {
        &self.sessions
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register the channel and run one stream to completion.
    pub async fn run(
        &self,
        request: StreamRequest,
        sink: &dyn OutputSink,
    ) -> Result<StreamOutcome, AgentError> {
        let cancel = self.sessions.register(&request.channel_id);
        self.run_with_token(request, cancel, sink).await
    }

    /// Run a stream whose channel the caller already registered.
    ///
    /// `cancel` must be the token [`StreamRegistry::register`] returned for
    /// `request.channel_id`; a token cancelled before the call ends the
    /// stream without opening the model. Exactly one `done: true` event is
    /// emitted on every path. Only a model-stream failure is returned as an
    /// error.
    pub async fn run_with_token(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
        sink: &dyn OutputSink,
    ) -> Result<StreamOutcome, AgentError> {
        let StreamRequest {
            channel_id,
            model,
            history,
            options,
        } = request;

        let started_at = Utc::now().to_rfc3339();
        let mut state = LoopState {
            original_message: original_message(&history).map(String::from),
            channel_id,
            history,
            tool_calls: 0,
            output: String::new(),
        };

        tracing::info!(
            channel_id = %state.channel_id,
            model = %model,
            history_len = state.history.len(),
            max_cycles = self.config.max_cycles,
            "stream started"
        );

        let result = self.drive(&mut state, &model, &options, &cancel, sink).await;

        let (status, error) = match result {
            Ok(()) => {
                sink.emit(StreamEvent::done(""));
                (StreamStatus::Completed, None)
            }
            Err(AgentError::CycleLimitExceeded { max }) => {
                sink.emit(StreamEvent::done(format!(
                    "\n\n[Note: Stopped after {max} tool calls to prevent infinite loops]\n\n"
                )));
                tracing::warn!(channel_id = %state.channel_id, max, "tool call limit reached");
                (StreamStatus::CycleLimitReached, None)
            }
            Err(AgentError::CancellationRequested { .. }) => {
                sink.emit(StreamEvent::done(""));
                tracing::info!(
                    channel_id = %state.channel_id,
                    tool_calls = state.tool_calls,
                    "stream cancelled"
                );
                (StreamStatus::Cancelled, None)
            }
            Err(e) => {
                sink.emit(StreamEvent::done(format!(
                    "\n\nError in tool processing: {}\n\n",
                    error_message(&e)
                )));
                tracing::error!(
                    channel_id = %state.channel_id,
                    kind = e.kind(),
                    terminal = e.is_terminal(),
                    error = %e,
                    "stream failed"
                );
                (StreamStatus::Completed, Some(e))
            }
        };

        // A cancelled entry was already removed by whoever cancelled it, and
        // the id may now belong to a newer stream.
        if status != StreamStatus::Cancelled {
            self.sessions.complete(&state.channel_id);
        }

        if let Some(db) = &self.database {
            let label = if error.is_some() { "failed" } else { status.as_str() };
            if let Err(e) =
                db.insert_stream_run(&state.channel_id, &model, label, state.tool_calls, &started_at)
            {
                tracing::warn!(error = %e, "failed to record stream run");
            }
        }

        if let Some(e) = error {
            return Err(e);
        }

        tracing::info!(
            channel_id = %state.channel_id,
            status = status.as_str(),
            tool_calls = state.tool_calls,
            "stream finished"
        );
        Ok(StreamOutcome {
            status,
            tool_calls: state.tool_calls,
            history: state.history,
            output: state.output,
        })
    }

    /// The cycle loop. `Ok` means natural completion.
    async fn drive(
        &self,
        state: &mut LoopState,
        model: &str,
        options: &ChatOptions,
        cancel: &CancellationToken,
        sink: &dyn OutputSink,
    ) -> Result<(), AgentError> {
        let channel_id = state.channel_id.clone();
        let cancelled = || AgentError::CancellationRequested {
            channel_id: channel_id.clone(),
        };

        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                opened = self.model.open_stream(model, &state.history, options, cancel.clone()) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(_) if cancel.is_cancelled() => return Err(cancelled()),
                Err(e) => return Err(stream_failure(&channel_id, e)),
            };

            let mut classifier = TokenClassifier::new();
            let mut detected: Option<DetectedToolCall> = None;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled()),
                    next = stream.next() => next,
                };
                let token = match next {
                    None => break,
                    Some(Ok(token)) => token,
                    Some(Err(e)) => return Err(stream_failure(&channel_id, e)),
                };

                self.sessions.touch(&state.channel_id);
                match classifier.push(&token) {
                    TokenClass::PassThrough => {
                        state.output.push_str(&token);
                        sink.emit(StreamEvent::token(token));
                    }
                    TokenClass::ToolCall(call) => {
                        detected = Some(call);
                        break;
                    }
                }
            }

            // Abandon the rest of this response; dropping aborts the request.
            drop(stream);
            if classifier.finish() {
                let malformed = AgentError::MalformedToolCall {
                    reason: "stream ended inside an unbalanced candidate".into(),
                };
                tracing::debug!(
                    channel_id = %state.channel_id,
                    kind = malformed.kind(),
                    error = %malformed,
                    "candidate released as text"
                );
            }

            let Some(DetectedToolCall { call, raw }) = detected else {
                return Ok(());
            };

            state.tool_calls += 1;
            self.sessions.record_cycle(&state.channel_id);
            let provider = call.provider(self.tools.dynamic_provider()).to_string();

            tracing::info!(
                channel_id = %state.channel_id,
                cycle = state.tool_calls,
                provider = %provider,
                tool = %call.tool_name,
                "executing tool call"
            );

            let mut outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                outcome = self.tools.invoke_tool(&provider, &call.tool_name, &call.arguments, &self.config.identity) => outcome,
            };

            let failure = tool_failure(&mut outcome);
            if let Some(failure) = &failure {
                tracing::warn!(
                    channel_id = %state.channel_id,
                    provider = %provider,
                    tool = %call.tool_name,
                    kind = failure.kind(),
                    terminal = failure.is_terminal(),
                    error = %failure,
                    "tool call failed, remediation spliced"
                );
            }
            self.record_transcript(
                state,
                &provider,
                &call.tool_name,
                &call.arguments,
                &outcome,
                failure.as_ref(),
            );

            state.history.push(ChatMessage::assistant(raw));
            state.history.push(ChatMessage::user(monitoring_prompt(
                state.tool_calls,
                &outcome.text,
                state.original_message.as_deref(),
            )));

            let result_msg = format!("\n\nTool result: {}\n\n", outcome.text);
            state.output.push_str(&result_msg);
            sink.emit(StreamEvent::token(result_msg));
            self.sessions.touch(&state.channel_id);

            if state.tool_calls >= self.config.max_cycles {
                return Err(AgentError::CycleLimitExceeded {
                    max: self.config.max_cycles,
                });
            }
        }
    }

    fn record_transcript(
        &self,
        state: &LoopState,
        provider: &str,
        tool: &str,
        arguments: &Map<String, Value>,
        outcome: &ToolCallOutcome,
        failure: Option<&AgentError>,
    ) {
        let Some(db) = &self.database else {
            return;
        };
        let arguments = Value::Object(arguments.clone());
        let entry = NewTranscriptEntry {
            channel_id: &state.channel_id,
            cycle: state.tool_calls,
            provider,
            tool_name: tool,
            arguments: &arguments,
            result: &outcome.text,
            is_error: outcome.is_error,
            error_kind: failure.map(AgentError::kind),
            execution_time_ms: outcome.elapsed_ms,
        };
        if let Err(e) = db.insert_transcript_entry(&entry) {
            tracing::warn!(error = %e, "failed to record tool transcript");
        }
    }
}

fn stream_failure(channel_id: &str, e: InferenceError) -> AgentError {
    tracing::debug!(
        channel_id = channel_id,
        transient = e.is_transient(),
        error = %e,
        "model stream failed"
    );
    e.into()
}

/// Typed failure of a tool call. The remediation text stays in the outcome.
fn tool_failure(outcome: &mut ToolCallOutcome) -> Option<AgentError> {
    match outcome.error.take() {
        Some(e) => Some(e.into()),
        None if outcome.is_error => Some(AgentError::ToolExecutionError {
            reason: outcome.text.clone(),
        }),
        None => None,
    }
}

/// Message text for the terminal error event, without the variant prefix.
fn error_message(e: &AgentError) -> String {
    match e {
        AgentError::StreamTransportError { reason } => reason.clone(),
        other => other.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
