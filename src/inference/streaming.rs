//! NDJSON streaming response parser for Ollama's `/api/chat`.
//!
//! Reads the HTTP body as a byte stream, splits it on newlines, parses each
//! line as a `ChatResponseLine`, and yields the content tokens. Lines are
//! split on raw bytes so a multi-byte character spanning two network chunks
//! is never mangled.

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;
use super::types::ChatResponseLine;

// ─── NDJSON line parser ──────────────────────────────────────────────────────

/// Parse a raw NDJSON byte stream into content tokens.
///
/// - empty-content lines are skipped
/// - a line with `done: true` ends the stream (after its content, if any)
/// - a line with `error` yields one `StreamError` and ends the stream
/// - a read error yields one `StreamError` and ends the stream
pub fn parse_ndjson_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<String, InferenceError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = LineState {
        byte_stream: Box::pin(byte_stream),
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            // Complete line already buffered?
            if let Some(pos) = state.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match process_line(&line) {
                    LineOutcome::Skip => continue,
                    LineOutcome::Token(token) => return Some((Ok(token), state)),
                    LineOutcome::Done(Some(token)) => {
                        state.finished = true;
                        return Some((Ok(token), state));
                    }
                    LineOutcome::Done(None) => return None,
                    LineOutcome::Error(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            // Need more data from the stream
            match state.byte_stream.next().await {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((
                        Err(InferenceError::StreamError {
                            reason: format!("stream read error: {e}"),
                        }),
                        state,
                    ));
                }
                None => {
                    // Stream ended without a trailing newline
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    return match process_line(&rest) {
                        LineOutcome::Token(token) | LineOutcome::Done(Some(token)) => {
                            Some((Ok(token), state))
                        }
                        LineOutcome::Error(e) => Some((Err(e), state)),
                        LineOutcome::Skip | LineOutcome::Done(None) => None,
                    };
                }
            }
        }
    })
}

struct LineState<B, E> {
    byte_stream: std::pin::Pin<Box<dyn Stream<Item = Result<B, E>> + Send>>,
    buffer: Vec<u8>,
    finished: bool,
}

enum LineOutcome {
    Skip,
    Token(String),
    Done(Option<String>),
    Error(InferenceError),
}

fn process_line(raw: &[u8]) -> LineOutcome {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return LineOutcome::Skip;
    }

    let line: ChatResponseLine = match serde_json::from_str(text) {
        Ok(line) => line,
        Err(e) => {
            return LineOutcome::Error(InferenceError::StreamError {
                reason: format!("failed to parse NDJSON line: {e} (line: {text})"),
            })
        }
    };

    if let Some(error) = line.error {
        return LineOutcome::Error(InferenceError::StreamError { reason: error });
    }

    let token = line
        .message
        .map(|m| m.content)
        .filter(|c| !c.is_empty());

    match (token, line.done) {
        (token, true) => LineOutcome::Done(token),
        (Some(token), false) => LineOutcome::Token(token),
        (None, false) => LineOutcome::Skip,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_bytes(parts: Vec<Vec<u8>>) -> Vec<Result<String, InferenceError>> {
        let items: Vec<Result<Vec<u8>, std::io::Error>> = parts.into_iter().map(Ok).collect();
        parse_ndjson_stream(stream::iter(items)).collect().await
    }

    async fn collect(parts: &[&str]) -> Vec<Result<String, InferenceError>> {
        collect_bytes(parts.iter().map(|p| p.as_bytes().to_vec()).collect()).await
    }

    #[tokio::test]
    async fn test_tokens_in_order() {
        let body = r#"{"message":{"content":"I'll"},"done":false}
{"message":{"content":" check."},"done":false}
{"message":{"content":""},"done":true}
"#;
        let tokens: Vec<String> = collect(&[body]).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(tokens, vec!["I'll", " check."]);
    }

    #[tokio::test]
    async fn test_line_split_across_chunks() {
        let tokens: Vec<String> = collect(&[
            r#"{"message":{"con"#,
            "tent\":\"{\"},\"done\":false}\n{\"message\":",
            "{\"content\":\"}\"},\"done\":false}\n",
        ])
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
        assert_eq!(tokens, vec!["{", "}"]);
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_chunks() {
        let line = "{\"message\":{\"content\":\"caf\u{e9}\"},\"done\":false}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let tokens: Vec<String> = collect_bytes(vec![line[..split].to_vec(), line[split..].to_vec()])
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(tokens, vec!["caf\u{e9}"]);
    }

    #[tokio::test]
    async fn test_done_stops_reading() {
        let body = r#"{"message":{"content":"end"},"done":true}
{"message":{"content":"ignored"},"done":false}
"#;
        let tokens: Vec<String> = collect(&[body]).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(tokens, vec!["end"]);
    }

    #[tokio::test]
    async fn test_error_line_ends_stream() {
        let body = r#"{"message":{"content":"a"},"done":false}
{"error":"model runner crashed"}
{"message":{"content":"b"},"done":false}
"#;
        let items = collect(&[body]).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        match &items[1] {
            Err(InferenceError::StreamError { reason }) => assert_eq!(reason, "model runner crashed"),
            other => panic!("expected StreamError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let tokens: Vec<String> = collect(&[r#"{"message":{"content":"tail"},"done":false}"#])
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(tokens, vec!["tail"]);
    }

    #[tokio::test]
    async fn test_read_error_surfaces() {
        let items: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"{\"message\":{\"content\":\"x\"},\"done\":false}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let out: Vec<_> = parse_ndjson_stream(stream::iter(items)).collect().await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(InferenceError::StreamError { .. })));
    }

    #[tokio::test]
    async fn test_malformed_line_is_error() {
        let items = collect(&["not json\n"]).await;
        assert!(matches!(items[0], Err(InferenceError::StreamError { .. })));
    }
}
