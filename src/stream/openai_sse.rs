//! Upstream events → OpenAI SSE
//!
//! Emits `chat.completion.chunk` objects as `data:` lines. The first
//! content chunk carries `delta.role`, assembled tool calls go out in
//! one chunk after the stream ends, and the final chunk carries the
//! finish_reason and usage before `data: [DONE]`.
//!
//! Thinking content is not split into typed blocks here; the OpenAI
//! vocabulary has none, so `<thinking>` spans pass through inline.

use async_stream::stream;
use futures::Stream;
use serde_json::{json, Value};

use crate::parser::{ToolCall, UpstreamEvent};
use crate::tokens;
use crate::util::generate_completion_id;

use super::{StreamContext, UpstreamEventReader, UpstreamStream};

fn chunk_json(
    id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
    usage: Option<Value>,
) -> String {
    let mut chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = usage {
        chunk["usage"] = usage;
    }
    format!("data: {}\n\n", chunk)
}

fn tool_calls_delta(calls: &[ToolCall]) -> Value {
    let entries: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            json!({
                "index": index,
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": if call.arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        call.arguments.clone()
                    },
                },
            })
        })
        .collect();
    json!({ "tool_calls": entries })
}

fn usage_json(input_tokens: u32, output_tokens: u32) -> Value {
    json!({
        "prompt_tokens": input_tokens,
        "completion_tokens": output_tokens,
        "total_tokens": input_tokens + output_tokens,
    })
}

/// OpenAI SSE stream over the upstream response.
pub fn stream_to_openai(
    upstream: UpstreamStream,
    ctx: StreamContext,
) -> impl Stream<Item = String> {
    stream! {
        let completion_id = generate_completion_id();
        let created = chrono::Utc::now().timestamp();
        let mut reader = UpstreamEventReader::new(upstream, &ctx);
        let mut first_content = true;
        let mut context_usage: Option<f64> = None;

        loop {
            match reader.next().await {
                Ok(Some(UpstreamEvent::Content(text))) => {
                    let delta = if first_content {
                        first_content = false;
                        json!({"role": "assistant", "content": text})
                    } else {
                        json!({"content": text})
                    };
                    yield chunk_json(&completion_id, created, &ctx.model, delta, None, None);
                }
                Ok(Some(UpstreamEvent::ContextUsage(percent))) => {
                    context_usage = Some(percent);
                }
                Ok(Some(UpstreamEvent::Exception(kind))) => {
                    tracing::warn!("Upstream exception event: {}", kind);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    // Mid-stream failures terminate the stream; the OpenAI
                    // vocabulary has no error event
                    tracing::error!("Stream failed mid-response: {}", e);
                    return;
                }
            }
        }

        let tool_calls = reader.finish_tool_calls();
        if !tool_calls.is_empty() {
            yield chunk_json(
                &completion_id,
                created,
                &ctx.model,
                tool_calls_delta(&tool_calls),
                None,
                None,
            );
        }

        let output_tokens = tokens::estimate_tokens(reader.content());
        let (input_tokens, source) = tokens::resolve_input_tokens(
            context_usage,
            &ctx.model,
            &ctx.request_messages,
            &ctx.request_tools,
        );
        tracing::debug!("usage input_tokens={} ({})", input_tokens, source.as_str());

        let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
        yield chunk_json(
            &completion_id,
            created,
            &ctx.model,
            json!({}),
            Some(finish_reason),
            Some(usage_json(input_tokens, output_tokens)),
        );
        yield "data: [DONE]\n\n".to_string();
    }
}

/// Non-streaming collection into a complete `chat.completion` object.
pub async fn collect_openai_response(
    upstream: UpstreamStream,
    ctx: StreamContext,
) -> Result<Value, crate::error::GatewayError> {
    let mut reader = UpstreamEventReader::new(upstream, &ctx);
    let mut context_usage: Option<f64> = None;

    loop {
        match reader.next().await? {
            Some(UpstreamEvent::ContextUsage(percent)) => context_usage = Some(percent),
            Some(_) => {}
            None => break,
        }
    }

    let tool_calls = reader.finish_tool_calls();
    let output_tokens = tokens::estimate_tokens(reader.content());
    let (input_tokens, source) = tokens::resolve_input_tokens(
        context_usage,
        &ctx.model,
        &ctx.request_messages,
        &ctx.request_tools,
    );
    tracing::debug!("usage input_tokens={} ({})", input_tokens, source.as_str());

    let mut message = json!({
        "role": "assistant",
        "content": reader.content(),
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = tool_calls_delta(&tool_calls)["tool_calls"].clone();
    }

    Ok(json!({
        "id": generate_completion_id(),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": ctx.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": if tool_calls.is_empty() { "stop" } else { "tool_calls" },
        }],
        "usage": usage_json(input_tokens, output_tokens),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::*;

    fn data_events(events: &[String]) -> Vec<Value> {
        events
            .iter()
            .filter(|e| !e.contains("[DONE]"))
            .map(|e| sse_data(e))
            .collect()
    }

    #[tokio::test]
    async fn test_role_on_first_chunk_only() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"content":"Hello "}"#),
            frame(r#"{"content":"world"}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", false);
        let events = collect_stream(stream_to_openai(upstream, ctx)).await;

        let chunks = data_events(&events);
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hello ");
        assert!(chunks[1]["choices"][0]["delta"].get("role").is_none());
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "world");

        assert!(events.last().unwrap().contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_final_chunk_reports_usage_and_stop() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"content":"Short answer"}"#),
            frame(r#"{"contextUsagePercentage":10.0}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", false);
        let events = collect_stream(stream_to_openai(upstream, ctx)).await;

        let chunks = data_events(&events);
        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        // Input tokens from the context-usage event: 10% of 200K
        assert_eq!(last["usage"]["prompt_tokens"], 20_000);
        assert!(last["usage"]["completion_tokens"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_tool_calls_chunk_and_finish_reason() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"toolUseId":"t1","name":"get_weather","input":"{\"city\":\"Paris\"}","stop":true}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", false);
        let events = collect_stream(stream_to_openai(upstream, ctx)).await;

        let chunks = data_events(&events);
        let tool_chunk = chunks
            .iter()
            .find(|c| c["choices"][0]["delta"].get("tool_calls").is_some())
            .expect("missing tool_calls chunk");
        let call = &tool_chunk["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 0);
        assert_eq!(call["id"], "t1");
        assert_eq!(call["function"]["name"], "get_weather");

        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
    }

    #[tokio::test]
    async fn test_thinking_tags_pass_inline() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"content":"<thinking>x</thinking>answer"}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", true);
        let events = collect_stream(stream_to_openai(upstream, ctx)).await;
        let chunks = data_events(&events);
        assert_eq!(
            chunks[0]["choices"][0]["delta"]["content"],
            "<thinking>x</thinking>answer"
        );
    }

    #[tokio::test]
    async fn test_collect_openai_response() {
        let upstream = upstream_from_chunks(vec![
            frame(r#"{"content":"The answer."}"#),
            frame(r#"{"toolUseId":"t1","name":"f","input":"{\"a\":1}","stop":true}"#),
        ]);
        let ctx = test_context("claude-sonnet-4", false);
        let response = collect_openai_response(upstream, ctx).await.unwrap();

        assert_eq!(response["object"], "chat.completion");
        assert_eq!(response["choices"][0]["message"]["content"], "The answer.");
        assert_eq!(
            response["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "f"
        );
        assert_eq!(response["choices"][0]["finish_reason"], "tool_calls");
        assert!(response["usage"]["total_tokens"].as_u64().unwrap() > 0);
    }
}
