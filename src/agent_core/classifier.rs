//! Token stream classifier.
//!
//! Consumes model output one token at a time and separates pass-through text
//! from embedded tool-call payloads of the form
//! `{"tool": "provider.tool", "arguments": {...}}`.
//!
//! Two states:
//! - `Normal`: every token passes through. A token that trims to exactly `{`
//!   starts a candidate.
//! - `Collecting`: tokens are buffered and still pass through while braces
//!   are unbalanced. When the count drops to zero the buffer is validated.
//!
//! A validated call withholds its closing token; a rejected candidate emits
//! it. Nothing already emitted is ever retracted.

use serde_json::{Map, Value};

/// Largest candidate buffer before collection is abandoned.
pub const MAX_CANDIDATE_BYTES: usize = 256 * 1024;

// ─── Types ───────────────────────────────────────────────────────────────────

/// A tool call parsed from model output. Lives for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Provider named in a dotted `provider.tool`, or `None` for a bare name.
    pub provider_guess: Option<String>,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// Provider to invoke, falling back to `dynamic_provider` for bare names.
    pub fn provider<'a>(&'a self, dynamic_provider: &'a str) -> &'a str {
        self.provider_guess.as_deref().unwrap_or(dynamic_provider)
    }
}

/// A completed detection.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedToolCall {
    pub call: ToolCall,
    /// The payload with `<think>` regions stripped and whitespace trimmed.
    pub raw: String,
}

/// What to do with the token just pushed.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenClass {
    /// Forward the token to the output sink.
    PassThrough,
    /// The token closed a valid tool call; do not forward it.
    ToolCall(DetectedToolCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    Normal,
    Collecting,
}

// ─── Classifier ──────────────────────────────────────────────────────────────

/// Brace-balancing state machine over a token stream.
#[derive(Debug)]
pub struct TokenClassifier {
    state: ClassifierState,
    buffer: String,
    brace_count: i64,
}

impl Default for TokenClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenClassifier {
    pub fn new() -> Self {
        Self {
            state: ClassifierState::Normal,
            buffer: String::new(),
            brace_count: 0,
        }
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    /// Classify one token.
    pub fn push(&mut self, token: &str) -> TokenClass {
        match self.state {
            ClassifierState::Normal => {
                if token.trim() == "{" {
                    self.state = ClassifierState::Collecting;
                    self.buffer.clear();
                    self.buffer.push_str(token);
                    self.brace_count = 1;
                }
                TokenClass::PassThrough
            }
            ClassifierState::Collecting => self.collect(token),
        }
    }

    fn collect(&mut self, token: &str) -> TokenClass {
        self.buffer.push_str(token);
        for c in token.chars() {
            match c {
                '{' => self.brace_count += 1,
                '}' => self.brace_count -= 1,
                _ => {}
            }
        }

        if self.brace_count > 0 {
            if self.buffer.len() > MAX_CANDIDATE_BYTES {
                tracing::warn!(
                    bytes = self.buffer.len(),
                    "tool call candidate too large, abandoning"
                );
                self.reset();
            }
            return TokenClass::PassThrough;
        }

        let cleaned = strip_think_blocks(&self.buffer).trim().to_string();
        self.reset();

        match parse_tool_call(&cleaned) {
            Some(call) => {
                tracing::debug!(
                    provider = call.provider_guess.as_deref().unwrap_or("<dynamic>"),
                    tool = %call.tool_name,
                    "tool call detected"
                );
                TokenClass::ToolCall(DetectedToolCall { call, raw: cleaned })
            }
            None => {
                tracing::trace!("balanced candidate is not a tool call");
                TokenClass::PassThrough
            }
        }
    }

    /// Reset at stream end. Returns whether an unfinished candidate was dropped.
    pub fn finish(&mut self) -> bool {
        let was_collecting = self.state == ClassifierState::Collecting;
        self.reset();
        was_collecting
    }

    fn reset(&mut self) {
        self.state = ClassifierState::Normal;
        self.buffer.clear();
        self.brace_count = 0;
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Remove every complete `<think>…</think>` region.
fn strip_think_blocks(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        match after_open.find(CLOSE) {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &after_open[end + CLOSE.len()..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Strict schema check: non-empty string `tool` plus an `arguments` or
/// `parameters` object. More than one dot in the name is rejected.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    let obj = parsed.as_object()?;

    let tool = obj.get("tool")?.as_str()?.trim();
    if tool.is_empty() {
        return None;
    }

    let arguments = obj
        .get("arguments")
        .and_then(|a| a.as_object())
        .or_else(|| obj.get("parameters").and_then(|p| p.as_object()))?
        .clone();

    let parts: Vec<&str> = tool.split('.').collect();
    let (provider_guess, tool_name) = match parts.as_slice() {
        [name] => (None, name.to_string()),
        [provider, name] if !provider.is_empty() && !name.is_empty() => {
            (Some(provider.to_string()), name.to_string())
        }
        _ => return None,
    };

    Some(ToolCall {
        provider_guess,
        tool_name,
        arguments,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed tokens; return (emitted text, detections).
    fn run(tokens: &[&str]) -> (String, Vec<DetectedToolCall>) {
        let mut classifier = TokenClassifier::new();
        let mut emitted = String::new();
        let mut detected = Vec::new();
        for token in tokens {
            match classifier.push(token) {
                TokenClass::PassThrough => emitted.push_str(token),
                TokenClass::ToolCall(call) => detected.push(call),
            }
        }
        classifier.finish();
        (emitted, detected)
    }

    #[test]
    fn test_plain_text_passes_through() {
        let (emitted, detected) = run(&["Hello", ", ", "world"]);
        assert_eq!(emitted, "Hello, world");
        assert!(detected.is_empty());
    }

    #[test]
    fn test_detects_dotted_call_and_withholds_closing_token() {
        let tokens = [
            "I'll check.",
            "\n",
            "{",
            "\"tool\": \"fs.list_directory\", ",
            "\"arguments\": {\"path\": \"/tmp\"}",
            "}",
        ];
        let (emitted, detected) = run(&tokens);

        assert_eq!(detected.len(), 1);
        let call = &detected[0].call;
        assert_eq!(call.provider_guess.as_deref(), Some("fs"));
        assert_eq!(call.tool_name, "list_directory");
        assert_eq!(call.arguments["path"], "/tmp");

        let total: usize = tokens.iter().map(|t| t.len()).sum();
        assert_eq!(emitted.len(), total - "}".len());
        assert!(emitted.starts_with("I'll check."));
    }

    #[test]
    fn test_rejected_candidate_emits_everything() {
        let tokens = ["{", "\"name\": ", "\"value\"", "}", " done"];
        let (emitted, detected) = run(&tokens);
        assert!(detected.is_empty());
        assert_eq!(emitted, tokens.concat());
    }

    #[test]
    fn test_well_formed_call_split_at_every_boundary() {
        let body = r#""tool": "web.fetch", "parameters": {"url": "https://example.com"}}"#;
        for i in 1..body.len() {
            if !body.is_char_boundary(i) {
                continue;
            }
            let (a, b) = body.split_at(i);
            let (_, detected) = run(&["{", a, b]);
            assert_eq!(detected.len(), 1, "split at {i}");
            assert_eq!(detected[0].call.provider_guess.as_deref(), Some("web"));
            assert_eq!(detected[0].call.tool_name, "fetch");
        }
    }

    #[test]
    fn test_detected_exactly_once_across_many_chunks() {
        let body = r#" "tool": "fs.read_file", "arguments": {"path": "/etc/hosts"} }"#;
        let chunks: Vec<String> = body.chars().map(|c| c.to_string()).collect();
        let mut tokens = vec!["{"];
        tokens.extend(chunks.iter().map(|s| s.as_str()));
        let (_, detected) = run(&tokens);
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].call.tool_name, "read_file");
    }

    #[test]
    fn test_bare_name_has_no_provider() {
        let (_, detected) = run(&["{", r#""tool": "make_tool", "arguments": {}"#, "}"]);
        let call = &detected[0].call;
        assert!(call.provider_guess.is_none());
        assert_eq!(call.provider("mcp-dynamic-tools"), "mcp-dynamic-tools");
    }

    #[test]
    fn test_malformed_payloads_never_detected() {
        let cases = [
            r#""tool": "a.b.c", "arguments": {}}"#,
            r#""tool": "fs.read_file"}"#,
            r#""tool": "fs.read_file", "arguments": "path=/tmp"}"#,
            r#""tool": "", "arguments": {}}"#,
            r#""tool": 42, "arguments": {}}"#,
            r#""tool": ".read", "arguments": {}}"#,
            r#" this is not json }"#,
        ];
        for case in cases {
            let mut classifier = TokenClassifier::new();
            classifier.push("{");
            assert_eq!(classifier.push(case), TokenClass::PassThrough, "case: {case}");
            assert_eq!(classifier.state(), ClassifierState::Normal);
        }
    }

    #[test]
    fn test_think_blocks_are_stripped() {
        let (_, detected) = run(&[
            "{",
            "<think>should I use {braces}?</think>",
            r#""tool": "fs.stat", "arguments": {"path": "/"}"#,
            "}",
        ]);
        assert_eq!(detected.len(), 1);
        assert!(!detected[0].raw.contains("think"));
        assert!(detected[0].raw.starts_with('{'));
    }

    #[test]
    fn test_only_bare_brace_token_starts_collection() {
        let mut classifier = TokenClassifier::new();
        classifier.push(r#"{"tool": "fs.stat", "arguments": {}}"#);
        assert_eq!(classifier.state(), ClassifierState::Normal);
        classifier.push("  {\n");
        assert_eq!(classifier.state(), ClassifierState::Collecting);
    }

    #[test]
    fn test_finish_resets_unbalanced_candidate() {
        let mut classifier = TokenClassifier::new();
        classifier.push("{");
        classifier.push(r#""tool": "fs.stat", "arguments": {"#);
        assert!(classifier.finish());
        assert_eq!(classifier.state(), ClassifierState::Normal);
        assert!(!classifier.finish());
    }

    #[test]
    fn test_oversized_candidate_abandoned() {
        let mut classifier = TokenClassifier::new();
        classifier.push("{");
        let filler = "x".repeat(MAX_CANDIDATE_BYTES);
        assert_eq!(classifier.push(&filler), TokenClass::PassThrough);
        assert_eq!(classifier.state(), ClassifierState::Normal);
    }

    #[test]
    fn test_excess_closing_braces_end_candidate() {
        let mut classifier = TokenClassifier::new();
        classifier.push("{");
        assert_eq!(classifier.push("}}"), TokenClass::PassThrough);
        assert_eq!(classifier.state(), ClassifierState::Normal);
    }

    #[test]
    fn test_strip_think_blocks_keeps_unclosed() {
        assert_eq!(strip_think_blocks("a<think>x</think>b<think>y</think>c"), "abc");
        assert_eq!(strip_think_blocks("a<think>open"), "a<think>open");
    }
}
