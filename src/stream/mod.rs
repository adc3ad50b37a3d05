//! Streaming engine
//!
//! Drives a single upstream call and exposes its event stream with the
//! timeout policy applied:
//!
//! - **First-token retry**: if no body bytes arrive within the first-token
//!   timeout, the request is cancelled and re-issued up to the retry cap.
//!   Only this opening phase retries; once bytes flow, failures propagate.
//! - **Inter-chunk tolerance**: after the first byte, a bounded number of
//!   consecutive read timeouts are swallowed with a warning to ride out
//!   slow generation phases on large contexts.
//!
//! The SSE emitters in the sibling modules consume [`UpstreamEventReader`]
//! and own nothing about transport.

pub mod anthropic_sse;
pub mod buffered;
pub mod openai_sse;

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::timeout;

use crate::error::GatewayError;
use crate::parser::{
    deduplicate_tool_calls, parse_bracket_tool_calls, EventStreamParser, ToolCall, UpstreamEvent,
};

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Per-request parameters the emitters need.
#[derive(Clone)]
pub struct StreamContext {
    pub model: String,
    pub thinking_enabled: bool,
    /// Request messages for local input-token counting
    pub request_messages: Vec<Value>,
    /// Tool definitions for local input-token counting
    pub request_tools: Vec<Value>,
    /// Per-chunk read timeout, already scaled for the model
    pub read_timeout: Duration,
    pub max_consecutive_timeouts: u32,
}

/// An opened upstream stream with its first chunk already in hand.
pub struct UpstreamStream {
    first_chunk: Option<Bytes>,
    body: ByteStream,
}

/// Outcome of opening the upstream call.
pub enum UpstreamOpen {
    Stream(UpstreamStream),
    /// Non-200 response; the body is read for error classification.
    ErrorStatus { status: u16, body: String },
}

/// POST the payload upstream and wait for the first body byte, retrying
/// the whole request while nothing has arrived.
pub async fn open_upstream_stream(
    client: &reqwest::Client,
    url: &str,
    access_token: &str,
    payload: &Value,
    first_token_timeout: Duration,
    max_retries: u32,
) -> Result<UpstreamOpen, GatewayError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let send_result = client
            .post(url)
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await;

        let response = match send_result {
            Ok(response) => response,
            Err(e) => {
                if attempt <= max_retries {
                    tracing::warn!(
                        "Upstream connect failed (attempt {}/{}): {}",
                        attempt,
                        max_retries + 1,
                        e
                    );
                    continue;
                }
                return Err(GatewayError::Upstream {
                    status: 502,
                    message: format!("Upstream connect failed: {}", e),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(UpstreamOpen::ErrorStatus {
                status: status.as_u16(),
                body,
            });
        }

        let mut body = Box::pin(response.bytes_stream()) as ByteStream;
        match timeout(first_token_timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => {
                if attempt > 1 {
                    tracing::info!("First token arrived after {} attempts", attempt);
                }
                return Ok(UpstreamOpen::Stream(UpstreamStream {
                    first_chunk: Some(chunk),
                    body,
                }));
            }
            Ok(Some(Err(e))) => {
                if attempt <= max_retries {
                    tracing::warn!(
                        "Upstream stream failed before first token (attempt {}/{}): {}",
                        attempt,
                        max_retries + 1,
                        e
                    );
                    continue;
                }
                return Err(GatewayError::FirstTokenTimeout);
            }
            Ok(None) => {
                // Empty but successful stream
                return Ok(UpstreamOpen::Stream(UpstreamStream {
                    first_chunk: None,
                    body,
                }));
            }
            Err(_) => {
                tracing::warn!(
                    "No first token within {:?} (attempt {}/{})",
                    first_token_timeout,
                    attempt,
                    max_retries + 1
                );
                if attempt > max_retries {
                    return Err(GatewayError::FirstTokenTimeout);
                }
                // Dropping the response cancels the in-flight request
            }
        }
    }
}

/// Reads chunks with the inter-chunk timeout policy applied.
struct ChunkReader {
    first_chunk: Option<Bytes>,
    body: ByteStream,
    read_timeout: Duration,
    max_consecutive_timeouts: u32,
    consecutive_timeouts: u32,
    model: String,
}

impl ChunkReader {
    /// Next chunk, `None` on clean end-of-stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, GatewayError> {
        if let Some(chunk) = self.first_chunk.take() {
            return Ok(Some(chunk));
        }

        loop {
            match timeout(self.read_timeout, self.body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    self.consecutive_timeouts = 0;
                    return Ok(Some(chunk));
                }
                Ok(Some(Err(e))) => {
                    return Err(GatewayError::Upstream {
                        status: 502,
                        message: format!("Upstream stream error: {}", e),
                    });
                }
                Ok(None) => return Ok(None),
                Err(_) => {
                    self.consecutive_timeouts += 1;
                    if self.consecutive_timeouts <= self.max_consecutive_timeouts {
                        tracing::warn!(
                            "Stream read timeout {}/{} after {:?} (model: {})",
                            self.consecutive_timeouts,
                            self.max_consecutive_timeouts,
                            self.read_timeout,
                            self.model
                        );
                        continue;
                    }
                    return Err(GatewayError::Upstream {
                        status: 504,
                        message: format!(
                            "Stream dead after {} consecutive read timeouts",
                            self.max_consecutive_timeouts
                        ),
                    });
                }
            }
        }
    }
}

/// Typed event reader over the upstream stream.
///
/// Owns the frame parser and the chunk reader; emitters call [`next`]
/// until it returns `None`, then collect the assembled tool calls.
pub struct UpstreamEventReader {
    chunks: ChunkReader,
    parser: EventStreamParser,
    pending: VecDeque<UpstreamEvent>,
    /// Concatenated content for the bracket-fallback pass and output
    /// token counting
    content: String,
}

impl UpstreamEventReader {
    pub fn new(upstream: UpstreamStream, ctx: &StreamContext) -> Self {
        Self {
            chunks: ChunkReader {
                first_chunk: upstream.first_chunk,
                body: upstream.body,
                read_timeout: ctx.read_timeout,
                max_consecutive_timeouts: ctx.max_consecutive_timeouts,
                consecutive_timeouts: 0,
                model: ctx.model.clone(),
            },
            parser: EventStreamParser::new(),
            pending: VecDeque::new(),
            content: String::new(),
        }
    }

    /// Next upstream event, `None` at clean end-of-stream.
    pub async fn next(&mut self) -> Result<Option<UpstreamEvent>, GatewayError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if let UpstreamEvent::Content(text) = &event {
                    self.content.push_str(text);
                }
                return Ok(Some(event));
            }

            match self.chunks.next_chunk().await? {
                Some(chunk) => {
                    self.pending.extend(self.parser.feed(&chunk));
                }
                None => return Ok(None),
            }
        }
    }

    /// Full assembled content so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// All tool calls: framed, plus the bracket-style fallback scan over
    /// the assembled content, deduplicated by id. Call after the stream
    /// ends.
    pub fn finish_tool_calls(&mut self) -> Vec<ToolCall> {
        let mut calls = self.parser.take_tool_calls();
        calls.extend(parse_bracket_tool_calls(&self.content));
        deduplicate_tool_calls(calls)
    }
}

/// Serialize one SSE event.
pub fn sse_event(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// Map a stream outcome onto an Anthropic stop_reason.
pub fn stop_reason(has_tool_calls: bool, exception: Option<&str>) -> &'static str {
    if let Some(kind) = exception {
        if kind.contains("CONTENT_LENGTH") || kind.contains("CONTEXT_WINDOW") {
            return "model_context_window_exceeded";
        }
        if kind.contains("MAX_TOKENS") {
            return "max_tokens";
        }
    }
    if has_tool_calls {
        "tool_use"
    } else {
        "end_turn"
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_event_reader_sequences_events() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"content":"Hello "}"#),
            frame(r#"{"content":"world"}"#),
            frame(r#"{"contextUsagePercentage":12.5}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", false);
        let mut reader = UpstreamEventReader::new(upstream, &ctx);

        let mut events = Vec::new();
        while let Some(event) = reader.next().await.unwrap() {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                UpstreamEvent::Content("Hello ".to_string()),
                UpstreamEvent::Content("world".to_string()),
                UpstreamEvent::ContextUsage(12.5),
            ]
        );
        assert_eq!(reader.content(), "Hello world");
    }

    #[tokio::test]
    async fn test_reader_merges_framed_and_bracket_tool_calls() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"toolUseId":"t1","name":"run","input":"{}","stop":true}"#),
            frame(r#"{"content":"[Called probe with args: {\"x\": 1}]"}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", false);
        let mut reader = UpstreamEventReader::new(upstream, &ctx);
        while reader.next().await.unwrap().is_some() {}

        let calls = reader.finish_tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "run");
        assert_eq!(calls[1].name, "probe");
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(stop_reason(false, None), "end_turn");
        assert_eq!(stop_reason(true, None), "tool_use");
        assert_eq!(
            stop_reason(false, Some("CONTENT_LENGTH_EXCEEDS_THRESHOLD")),
            "model_context_window_exceeded"
        );
        assert_eq!(stop_reason(false, Some("MAX_TOKENS_REACHED")), "max_tokens");
        // Exceptions win over tool calls
        assert_eq!(stop_reason(true, Some("MAX_TOKENS_REACHED")), "max_tokens");
    }

    #[test]
    fn test_sse_event_format() {
        let event = sse_event("ping", &serde_json::json!({"type": "ping"}));
        assert_eq!(event, "event: ping\ndata: {\"type\":\"ping\"}\n\n");
    }

    /// Tiny upstream double: the first `stall_count` connections send
    /// headers but never a body byte; later ones send one framed event.
    async fn spawn_stalling_upstream(stall_count: usize) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut held = Vec::new();
            let mut attempt = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                attempt += 1;

                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;

                let headers = "HTTP/1.1 200 OK\r\ncontent-type: application/octet-stream\r\ntransfer-encoding: chunked\r\n\r\n";
                if socket.write_all(headers.as_bytes()).await.is_err() {
                    continue;
                }

                if attempt <= stall_count {
                    // Stall: keep the connection open, send nothing
                    held.push(socket);
                    continue;
                }

                let payload = frame(r#"{"content":"made it"}"#);
                let mut body = format!("{:x}\r\n", payload.len()).into_bytes();
                body.extend_from_slice(&payload);
                body.extend_from_slice(b"\r\n0\r\n\r\n");
                let _ = socket.write_all(&body).await;
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_first_token_retry_succeeds_after_stalls() {
        let addr = spawn_stalling_upstream(2).await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/generateAssistantResponse", addr);

        let open = open_upstream_stream(
            &client,
            &url,
            "test-token",
            &serde_json::json!({}),
            Duration::from_millis(300),
            2,
        )
        .await
        .unwrap();

        let upstream = match open {
            UpstreamOpen::Stream(upstream) => upstream,
            UpstreamOpen::ErrorStatus { status, .. } => panic!("unexpected status {}", status),
        };

        let ctx = test_context("claude-sonnet-4", false);
        let mut reader = UpstreamEventReader::new(upstream, &ctx);
        let event = reader.next().await.unwrap();
        assert_eq!(event, Some(UpstreamEvent::Content("made it".to_string())));
    }

    #[tokio::test]
    async fn test_first_token_retries_exhausted() {
        // Every attempt stalls; one retry allowed
        let addr = spawn_stalling_upstream(usize::MAX).await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/generateAssistantResponse", addr);

        let result = open_upstream_stream(
            &client,
            &url,
            "test-token",
            &serde_json::json!({}),
            Duration::from_millis(100),
            1,
        )
        .await;

        assert!(matches!(result, Err(GatewayError::FirstTokenTimeout)));
    }
}
