//! Streaming passthrough
//!
//! Forwards the upstream SSE stream to the client frame by frame while
//! accumulating completion tokens from the incremental deltas. The commit
//! guard travels inside the body stream, so settlement runs when the stream
//! ends — including a client disconnect mid-stream.

use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde_json::Value;

use super::context::TokenUsage;
use super::executor::CommitGuard;
use crate::token;

/// What one SSE line means to the token tally.
#[derive(Debug, PartialEq, Eq)]
enum SseFrame<'a> {
    /// A `data:` frame carrying a JSON chunk.
    Data(&'a str),
    /// The `data: [DONE]` terminator.
    Done,
    /// Comments, `event:` lines, blank keep-alives.
    Other,
}

fn classify(line: &str) -> SseFrame<'_> {
    let Some(payload) = line.strip_prefix("data:") else {
        return SseFrame::Other;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        SseFrame::Done
    } else if payload.is_empty() {
        SseFrame::Other
    } else {
        SseFrame::Data(payload)
    }
}

/// Incremental scanner over the upstream SSE bytes.
///
/// The raw bytes are relayed untouched; the scanner only carries the split
/// tail of the last network chunk so every `data:` frame is accounted exactly
/// once, no matter where the line breaks land.
struct FrameScanner {
    carry: Vec<u8>,
    model: String,
    usage: Arc<Mutex<TokenUsage>>,
}

impl FrameScanner {
    fn new(model: String, usage: Arc<Mutex<TokenUsage>>) -> Self {
        Self {
            carry: Vec::new(),
            model,
            usage,
        }
    }

    /// Consume one network chunk, folding every frame it completes into the
    /// usage tally.
    fn scan(&mut self, chunk: &[u8]) {
        self.carry.extend_from_slice(chunk);
        while let Some(line) = self.take_line() {
            if let SseFrame::Data(payload) = classify(&line) {
                accumulate_frame(payload, &self.model, &self.usage);
            }
        }
    }

    /// Pop the next complete line off the carry buffer, dropping its CR/LF
    /// terminator. Returns `None` while the tail is still mid-line.
    fn take_line(&mut self) -> Option<String> {
        let newline = self.carry.iter().position(|&b| b == b'\n')?;
        let tail = self.carry.split_off(newline + 1);
        let mut line = std::mem::replace(&mut self.carry, tail);
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Fold one parsed SSE frame into the usage tracker. Incremental
/// `choices[*].delta.content` text is counted with the request's encoder; a
/// final frame carrying a `usage` object overrides the accumulated counts.
pub fn accumulate_frame(data: &str, model: &str, usage: &Mutex<TokenUsage>) {
    let frame: Value = match serde_json::from_str(data) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(%err, "unparseable SSE frame, skipping token accounting");
            return;
        }
    };

    if let Some(reported) = frame.get("usage") {
        let prompt = reported
            .get("prompt_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let completion = reported
            .get("completion_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if prompt > 0 || completion > 0 {
            *usage.lock().unwrap() = TokenUsage::new(prompt, completion);
            return;
        }
    }

    if let Some(choices) = frame.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(content) = choice
                .get("delta")
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
            {
                let tokens = token::count_text(content, model);
                usage.lock().unwrap().completion_tokens += tokens;
            }
        }
    }
}

/// Relay the upstream SSE body to the client, counting tokens as frames
/// complete. The guard is owned by the body stream and settles the ledger
/// when the stream is dropped, whether it ran to EOF or the client went away.
pub fn passthrough(
    upstream: reqwest::Response,
    model: String,
    usage: Arc<Mutex<TokenUsage>>,
    guard: CommitGuard,
) -> Response {
    let mut scanner = FrameScanner::new(model, usage);
    let stream = upstream.bytes_stream().map(move |chunk| {
        // owned by the closure so settlement tracks the stream's lifetime
        let _settle_on_drop = &guard;
        match chunk {
            Ok(bytes) => {
                scanner.scan(bytes.as_ref());
                Ok(bytes)
            }
            Err(err) => {
                tracing::warn!(%err, "upstream stream read failed");
                Err(std::io::Error::other(err.to_string()))
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("transfer-encoding", "chunked")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|err| {
            tracing::error!(%err, "failed to build stream response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner(usage: &Arc<Mutex<TokenUsage>>) -> FrameScanner {
        FrameScanner::new("gpt-3.5-turbo".to_string(), usage.clone())
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("data: {\"id\":1}"), SseFrame::Data("{\"id\":1}"));
        assert_eq!(classify("data:{\"id\":1}"), SseFrame::Data("{\"id\":1}"));
        assert_eq!(classify("data: [DONE]"), SseFrame::Done);
        assert_eq!(classify("data:  [DONE]  "), SseFrame::Done);
        assert_eq!(classify("data:"), SseFrame::Other);
        assert_eq!(classify("event: message"), SseFrame::Other);
        assert_eq!(classify(""), SseFrame::Other);
        assert_eq!(classify(": keep-alive"), SseFrame::Other);
    }

    #[test]
    fn test_scanner_accounts_split_frames_once() {
        let usage = Arc::new(Mutex::new(TokenUsage::default()));
        let mut scanner = scanner(&usage);

        let frame = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n";
        let (head, tail) = frame.split_at(17);

        // mid-line: nothing accounted yet
        scanner.scan(head);
        assert_eq!(usage.lock().unwrap().completion_tokens, 0);

        scanner.scan(tail);
        assert_eq!(
            usage.lock().unwrap().completion_tokens,
            crate::token::count_text("Hello", "gpt-3.5-turbo")
        );
    }

    #[test]
    fn test_scanner_handles_crlf_and_done() {
        let usage = Arc::new(Mutex::new(TokenUsage::default()));
        let mut scanner = scanner(&usage);

        scanner.scan(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\ndata: [DONE]\r\n",
        );
        assert_eq!(
            usage.lock().unwrap().completion_tokens,
            crate::token::count_text("hi", "gpt-3.5-turbo")
        );
        assert!(scanner.carry.is_empty());
    }

    #[test]
    fn test_scanner_ignores_non_data_lines() {
        let usage = Arc::new(Mutex::new(TokenUsage::default()));
        let mut scanner = scanner(&usage);

        scanner.scan(b"event: message\n: comment\n\n");
        assert_eq!(usage.lock().unwrap().total(), 0);
    }

    #[test]
    fn test_accumulate_counts_delta_content() {
        let usage = Mutex::new(TokenUsage::default());
        let frame = r#"{"choices":[{"delta":{"content":"hello world"}}]}"#;
        accumulate_frame(frame, "gpt-3.5-turbo", &usage);
        let counted = usage.lock().unwrap().completion_tokens;
        assert_eq!(
            counted,
            crate::token::count_text("hello world", "gpt-3.5-turbo")
        );

        // frames without content leave the count untouched
        accumulate_frame(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "gpt-3.5-turbo",
            &usage,
        );
        assert_eq!(usage.lock().unwrap().completion_tokens, counted);
    }

    #[test]
    fn test_accumulate_usage_frame_overrides() {
        let usage = Mutex::new(TokenUsage::new(10, 3));
        let frame = r#"{"choices":[],"usage":{"prompt_tokens":42,"completion_tokens":17}}"#;
        accumulate_frame(frame, "gpt-3.5-turbo", &usage);
        let snapshot = *usage.lock().unwrap();
        assert_eq!(snapshot.prompt_tokens, 42);
        assert_eq!(snapshot.completion_tokens, 17);
    }

    #[test]
    fn test_accumulate_ignores_garbage() {
        let usage = Mutex::new(TokenUsage::default());
        accumulate_frame("not json", "gpt-3.5-turbo", &usage);
        assert_eq!(usage.lock().unwrap().total(), 0);
    }
}
