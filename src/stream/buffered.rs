//! Buffered Anthropic streaming
//!
//! Variant for clients that meter on `message_start.usage.input_tokens`:
//! the upstream stream is consumed to completion first, so the accurate
//! input-token count (from the context-usage event) is known before any
//! content event is emitted. While buffering, a ping keepalive goes out
//! every 25 seconds so clients holding the connection open don't time
//! out. The cost is end-to-end latency.

use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::parser::thinking::ThinkingStreamHandler;
use crate::parser::{ToolCall, UpstreamEvent};
use crate::tokens;
use crate::util::generate_message_id;

use super::anthropic_sse::{
    error_event, message_delta_event, message_start_event, message_stop_event,
    AnthropicEventBuilder,
};
use super::{sse_event, stop_reason, StreamContext, UpstreamEventReader, UpstreamStream};

/// Keepalive interval while the upstream stream is being buffered.
const PING_INTERVAL: Duration = Duration::from_secs(25);
/// How often the generator polls the background task.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the background drive produced.
struct BufferedOutcome {
    /// Content-block SSE events in emission order
    events: Vec<String>,
    tool_calls: Vec<ToolCall>,
    content: String,
    context_usage: Option<f64>,
    exception: Option<String>,
}

/// Aborts the buffering task if the client disconnects mid-buffer.
struct AbortOnDrop(Option<JoinHandle<Result<BufferedOutcome, GatewayError>>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}

/// Drive the upstream to completion, buffering content-block events.
async fn buffer_stream(
    upstream: UpstreamStream,
    ctx: StreamContext,
) -> Result<BufferedOutcome, GatewayError> {
    let mut reader = UpstreamEventReader::new(upstream, &ctx);
    let mut thinking = ThinkingStreamHandler::new(ctx.thinking_enabled);
    let mut builder = AnthropicEventBuilder::new();
    let mut events = Vec::new();
    let mut context_usage = None;
    let mut exception = None;

    loop {
        match reader.next().await? {
            Some(UpstreamEvent::Content(text)) => {
                for te in thinking.process(&text) {
                    events.extend(builder.handle(&te));
                }
            }
            Some(UpstreamEvent::ContextUsage(percent)) => {
                tracing::debug!("contextUsageEvent: {}%", percent);
                context_usage = Some(percent);
            }
            Some(UpstreamEvent::Exception(kind)) => {
                tracing::warn!("Upstream exception event: {}", kind);
                exception = Some(kind);
            }
            Some(_) => {}
            None => break,
        }
    }

    // Finalize: drain the thinking handler, close open blocks, then
    // append the assembled tool_use blocks.
    for te in thinking.flush() {
        events.extend(builder.handle(&te));
    }
    events.extend(builder.close_open_blocks());

    let tool_calls = reader.finish_tool_calls();
    for call in &tool_calls {
        events.extend(builder.tool_use_block(call));
    }

    Ok(BufferedOutcome {
        events,
        tool_calls,
        content: reader.content().to_string(),
        context_usage,
        exception,
    })
}

/// Buffered Anthropic SSE stream with accurate input_tokens.
pub fn stream_to_anthropic_buffered(
    upstream: UpstreamStream,
    ctx: StreamContext,
) -> impl Stream<Item = String> {
    stream! {
        let task_ctx = ctx.clone();
        let mut guard = AbortOnDrop(Some(tokio::spawn(buffer_stream(upstream, task_ctx))));

        // Keepalive loop while the background drive runs
        let mut last_ping = tokio::time::Instant::now();
        while guard.0.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            tokio::time::sleep(POLL_INTERVAL).await;
            if last_ping.elapsed() >= PING_INTERVAL {
                tracing::debug!("Sending ping keepalive (buffered mode)");
                yield sse_event("ping", &json!({"type": "ping"}));
                last_ping = tokio::time::Instant::now();
            }
        }

        let outcome = match guard.0.take() {
            Some(handle) => match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    yield error_event(&e.to_string());
                    return;
                }
                Err(e) => {
                    yield error_event(&format!("buffered stream task failed: {}", e));
                    return;
                }
            },
            None => return,
        };

        // Corrected message_start: the accurate value is available now
        let (input_tokens, source) = tokens::resolve_input_tokens(
            outcome.context_usage,
            &ctx.model,
            &ctx.request_messages,
            &ctx.request_tools,
        );
        let output_tokens = tokens::estimate_tokens(&outcome.content);
        tracing::info!(
            "[buffered] {}: input_tokens={} ({}), output_tokens={}",
            ctx.model,
            input_tokens,
            source.as_str(),
            output_tokens
        );

        yield message_start_event(&generate_message_id(), &ctx.model, input_tokens);
        for event in outcome.events {
            yield event;
        }

        let reason = stop_reason(!outcome.tool_calls.is_empty(), outcome.exception.as_deref());
        yield message_delta_event(reason, output_tokens);
        yield message_stop_event();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::*;

    fn event_names(events: &[String]) -> Vec<String> {
        events
            .iter()
            .map(|e| {
                e.lines()
                    .next()
                    .unwrap()
                    .trim_start_matches("event:")
                    .trim()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_accurate_input_tokens_in_message_start() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"contextUsagePercentage":10.0}"#),
            frame(r#"{"content":"A response of some twenty tokens or thereabouts."}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", false);
        let events = collect_stream(stream_to_anthropic_buffered(upstream, ctx)).await;

        // message_start leads despite the content arriving before it ended
        let names = event_names(&events);
        assert_eq!(names[0], "message_start");

        let start = sse_data(&events[0]);
        // 10% of the 200K window, from the context-usage event
        assert_eq!(start["message"]["usage"]["input_tokens"], 20_000);

        let expected_output =
            tokens::estimate_tokens("A response of some twenty tokens or thereabouts.");
        let delta_index = names.iter().position(|n| n == "message_delta").unwrap();
        let delta = sse_data(&events[delta_index]);
        assert_eq!(
            delta["usage"]["output_tokens"].as_u64().unwrap(),
            expected_output as u64
        );
        assert_eq!(names.last().map(String::as_str), Some("message_stop"));
    }

    #[tokio::test]
    async fn test_local_fallback_without_context_usage() {
        let upstream = upstream_from_chunks(vec![frame(r#"{"content":"hi"}"#)]);
        let ctx = test_context("claude-sonnet-4", false);
        let events = collect_stream(stream_to_anthropic_buffered(upstream, ctx)).await;

        let start = sse_data(&events[0]);
        let (expected, _) = tokens::resolve_input_tokens(
            None,
            "claude-sonnet-4",
            &[serde_json::json!({"role": "user", "content": "Hi"})],
            &[],
        );
        assert_eq!(
            start["message"]["usage"]["input_tokens"].as_u64().unwrap(),
            expected as u64
        );
    }

    #[tokio::test]
    async fn test_event_order_preserved() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"content":"<thinking>plan</thinking>result"}"#),
            frame(r#"{"toolUseId":"t1","name":"f","input":"{}","stop":true}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", true);
        let events = collect_stream(stream_to_anthropic_buffered(upstream, ctx)).await;

        let names = event_names(&events);
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",  // thinking 0
                "content_block_delta",
                "content_block_stop",
                "content_block_start",  // text 1
                "content_block_delta",
                "content_block_stop",
                "content_block_start",  // tool_use 2
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let delta_index = names.iter().position(|n| n == "message_delta").unwrap();
        assert_eq!(
            sse_data(&events[delta_index])["delta"]["stop_reason"],
            "tool_use"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_keepalive_while_buffering() {
        // An upstream that takes a simulated minute before yielding
        let slow_body = stream! {
            tokio::time::sleep(Duration::from_secs(60)).await;
            yield Ok::<bytes::Bytes, reqwest::Error>(bytes::Bytes::from(frame(r#"{"content":"done"}"#)));
        };
        let upstream = UpstreamStream {
            first_chunk: None,
            body: Box::pin(slow_body),
        };
        let mut ctx = test_context("claude-sonnet-4", false);
        ctx.read_timeout = Duration::from_secs(300);

        let events = collect_stream(stream_to_anthropic_buffered(upstream, ctx)).await;
        let pings = events.iter().filter(|e| e.starts_with("event: ping")).count();
        // 60 seconds of buffering at a 25s interval: two pings
        assert_eq!(pings, 2);

        // And the real events still follow
        let names = event_names(&events);
        assert!(names.contains(&"message_start".to_string()));
        assert!(names.contains(&"message_stop".to_string()));
    }
}
