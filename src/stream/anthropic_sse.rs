//! Upstream events → Anthropic SSE
//!
//! Emits the Anthropic Messages streaming vocabulary: `message_start`,
//! interleaved text/thinking content blocks, `tool_use` blocks, then
//! `message_delta` and `message_stop`. Block indices are monotonically
//! increasing across all blocks, and every delta is bracketed by the
//! start/stop events of its index.

use async_stream::stream;
use futures::Stream;
use serde_json::{json, Value};

use crate::parser::thinking::{SegmentKind, ThinkingAction, ThinkingEvent, ThinkingStreamHandler};
use crate::parser::{ToolCall, UpstreamEvent};
use crate::tokens;
use crate::util::generate_message_id;

use super::{sse_event, stop_reason, StreamContext, UpstreamEventReader, UpstreamStream};

/// Tracks open blocks and the running index across a response.
pub(crate) struct AnthropicEventBuilder {
    index: u32,
    text_open: bool,
    thinking_open: bool,
}

impl AnthropicEventBuilder {
    pub(crate) fn new() -> Self {
        Self {
            index: 0,
            text_open: false,
            thinking_open: false,
        }
    }

    /// Translate one channel event into SSE strings.
    pub(crate) fn handle(&mut self, event: &ThinkingEvent) -> Vec<String> {
        let mut out = Vec::new();
        match (event.kind, event.action) {
            (SegmentKind::Thinking, ThinkingAction::Start) => {
                if self.text_open {
                    out.push(self.block_stop());
                }
                out.push(sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": self.index,
                        "content_block": {"type": "thinking", "thinking": ""},
                    }),
                ));
                self.thinking_open = true;
            }
            (SegmentKind::Thinking, ThinkingAction::Delta) => {
                if self.thinking_open && !event.content.is_empty() {
                    out.push(sse_event(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": self.index,
                            "delta": {"type": "thinking_delta", "thinking": event.content},
                        }),
                    ));
                }
            }
            (SegmentKind::Thinking, ThinkingAction::Stop) => {
                if self.thinking_open {
                    out.push(self.block_stop());
                }
            }
            (SegmentKind::Text, ThinkingAction::Delta) => {
                if !self.text_open {
                    out.push(sse_event(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": self.index,
                            "content_block": {"type": "text", "text": ""},
                        }),
                    ));
                    self.text_open = true;
                }
                out.push(sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.index,
                        "delta": {"type": "text_delta", "text": event.content},
                    }),
                ));
            }
            (SegmentKind::Text, _) => {}
        }
        out
    }

    /// Close whichever block is open.
    pub(crate) fn close_open_blocks(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.thinking_open || self.text_open {
            out.push(self.block_stop());
        }
        out
    }

    /// A complete tool_use block: start, one input_json_delta, stop.
    pub(crate) fn tool_use_block(&mut self, call: &ToolCall) -> Vec<String> {
        let input: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
        let mut out = vec![sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.index,
                "content_block": {
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": {},
                },
            }),
        )];
        out.push(sse_event(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.index,
                "delta": {
                    "type": "input_json_delta",
                    "partial_json": input.to_string(),
                },
            }),
        ));
        out.push(sse_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.index}),
        ));
        self.index += 1;
        out
    }

    fn block_stop(&mut self) -> String {
        let event = sse_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.index}),
        );
        self.index += 1;
        self.text_open = false;
        self.thinking_open = false;
        event
    }
}

/// The message_start envelope.
pub(crate) fn message_start_event(message_id: &str, model: &str, input_tokens: u32) -> String {
    sse_event(
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {
                    "input_tokens": input_tokens,
                    "output_tokens": 0,
                    "cache_creation_input_tokens": 0,
                    "cache_read_input_tokens": 0,
                },
            },
        }),
    )
}

pub(crate) fn message_delta_event(reason: &str, output_tokens: u32) -> String {
    sse_event(
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": {"stop_reason": reason, "stop_sequence": null},
            "usage": {"output_tokens": output_tokens},
        }),
    )
}

pub(crate) fn message_stop_event() -> String {
    sse_event("message_stop", &json!({"type": "message_stop"}))
}

pub(crate) fn error_event(message: &str) -> String {
    sse_event(
        "error",
        &json!({
            "type": "error",
            "error": {"type": "api_error", "message": message},
        }),
    )
}

/// Standard (non-buffered) Anthropic SSE stream.
///
/// `message_start` goes out immediately, so its `input_tokens` is the
/// local estimate; the upstream context-usage event has not arrived yet.
pub fn stream_to_anthropic(
    upstream: UpstreamStream,
    ctx: StreamContext,
) -> impl Stream<Item = String> {
    stream! {
        let message_id = generate_message_id();
        let (input_tokens, source) = tokens::resolve_input_tokens(
            None,
            &ctx.model,
            &ctx.request_messages,
            &ctx.request_tools,
        );
        tracing::debug!(
            "message_start input_tokens={} ({})",
            input_tokens,
            source.as_str()
        );
        yield message_start_event(&message_id, &ctx.model, input_tokens);

        let mut reader = UpstreamEventReader::new(upstream, &ctx);
        let mut thinking = ThinkingStreamHandler::new(ctx.thinking_enabled);
        let mut builder = AnthropicEventBuilder::new();
        let mut exception: Option<String> = None;

        loop {
            match reader.next().await {
                Ok(Some(UpstreamEvent::Content(text))) => {
                    for event in thinking.process(&text) {
                        for sse in builder.handle(&event) {
                            yield sse;
                        }
                    }
                }
                Ok(Some(UpstreamEvent::ToolCall(_))) => {
                    // Emitted after content blocks close; the reader keeps
                    // the completed calls
                }
                Ok(Some(UpstreamEvent::ContextUsage(percent))) => {
                    tracing::debug!("contextUsageEvent: {}%", percent);
                }
                Ok(Some(UpstreamEvent::Usage(credits))) => {
                    tracing::debug!("Upstream metering: {}", credits);
                }
                Ok(Some(UpstreamEvent::Exception(kind))) => {
                    tracing::warn!("Upstream exception event: {}", kind);
                    exception = Some(kind);
                }
                Ok(None) => break,
                Err(e) => {
                    yield error_event(&e.to_string());
                    return;
                }
            }
        }

        for event in thinking.flush() {
            for sse in builder.handle(&event) {
                yield sse;
            }
        }
        for sse in builder.close_open_blocks() {
            yield sse;
        }

        let tool_calls = reader.finish_tool_calls();
        for call in &tool_calls {
            for sse in builder.tool_use_block(call) {
                yield sse;
            }
        }

        let output_tokens = tokens::estimate_tokens(reader.content());
        let reason = stop_reason(!tool_calls.is_empty(), exception.as_deref());
        yield message_delta_event(reason, output_tokens);
        yield message_stop_event();
    }
}

/// Non-streaming collection into a complete `message` JSON object.
pub async fn collect_anthropic_response(
    upstream: UpstreamStream,
    ctx: StreamContext,
) -> Result<Value, crate::error::GatewayError> {
    let mut reader = UpstreamEventReader::new(upstream, &ctx);
    let mut thinking = ThinkingStreamHandler::new(ctx.thinking_enabled);
    let mut thinking_text = String::new();
    let mut text = String::new();
    let mut context_usage: Option<f64> = None;
    let mut exception: Option<String> = None;

    let mut absorb = |events: Vec<ThinkingEvent>| {
        for event in events {
            match event.kind {
                SegmentKind::Thinking => thinking_text.push_str(&event.content),
                SegmentKind::Text => text.push_str(&event.content),
            }
        }
    };

    loop {
        match reader.next().await? {
            Some(UpstreamEvent::Content(chunk)) => absorb(thinking.process(&chunk)),
            Some(UpstreamEvent::ContextUsage(percent)) => context_usage = Some(percent),
            Some(UpstreamEvent::Exception(kind)) => exception = Some(kind),
            Some(_) => {}
            None => break,
        }
    }
    absorb(thinking.flush());

    let tool_calls = reader.finish_tool_calls();
    let output_tokens = tokens::estimate_tokens(reader.content());
    let (input_tokens, source) = tokens::resolve_input_tokens(
        context_usage,
        &ctx.model,
        &ctx.request_messages,
        &ctx.request_tools,
    );
    tracing::debug!("input_tokens={} ({})", input_tokens, source.as_str());

    let mut content = Vec::new();
    if !thinking_text.is_empty() {
        content.push(json!({"type": "thinking", "thinking": thinking_text}));
    }
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    for call in &tool_calls {
        let input: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": input,
        }));
    }

    Ok(json!({
        "id": generate_message_id(),
        "type": "message",
        "role": "assistant",
        "model": ctx.model,
        "content": content,
        "stop_reason": stop_reason(!tool_calls.is_empty(), exception.as_deref()),
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        },
    }))
}
