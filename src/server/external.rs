//! External API account delegation
//!
//! When the allocator picks an external account instead of an upstream
//! credential, the request goes out to that account's `api_base` in its
//! configured format. 429 responses are retried with exponential backoff
//! honoring Retry-After; OpenAI-format responses are converted back to
//! Anthropic SSE for Anthropic-shaped clients.

use std::collections::HashMap;
use std::time::Duration;

use async_stream::stream;
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::convert::{
    ContentPart, ConversationRequest, MessageContent, Role, ThinkingMode, ToolChoice,
};
use crate::error::{GatewayError, WireFormat};
use crate::parser::thinking::ThinkingStreamHandler;
use crate::stream::anthropic_sse::{
    message_delta_event, message_start_event, message_stop_event, AnthropicEventBuilder,
};
use crate::stream::sse_event;
use crate::store::ExternalApiAccount;
use crate::tokens;
use crate::util::generate_message_id;

use super::{json_response, sse_response, with_completion, AppState};

const MAX_RETRIES: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(300);

/// Route a request to an external API account and relay the response.
pub async fn handle_external(
    state: std::sync::Arc<AppState>,
    account: ExternalApiAccount,
    request: ConversationRequest,
    client_format: WireFormat,
    endpoint: &'static str,
) -> Response {
    tracing::info!(
        "External route: account {} ({}), format={}, provider={}, endpoint={}",
        account.id,
        account.name,
        account.format,
        account.provider,
        endpoint
    );

    let debug_mode = state.config.debug_mode;
    let result = match (account.format.as_str(), client_format) {
        ("anthropic", WireFormat::Anthropic) => {
            anthropic_outbound(state, account, request).await
        }
        ("openai", WireFormat::Anthropic) => {
            openai_outbound_to_anthropic(state, account, request).await
        }
        ("openai", WireFormat::OpenAi) => openai_passthrough(state, account, request).await,
        (other, _) => Err(GatewayError::Internal(format!(
            "external account format '{}' cannot serve a {} client",
            other,
            client_format.name()
        ))),
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response_for(client_format, debug_mode),
    }
}

/// Backoff delay for a 429, honoring Retry-After when parseable.
fn retry_delay(retry_after: Option<&str>, attempt: u32) -> Duration {
    if let Some(value) = retry_after {
        if let Ok(secs) = value.trim().parse::<f64>() {
            if secs.is_finite() && secs >= 0.0 {
                return Duration::from_secs_f64(secs).min(MAX_RETRY_DELAY);
            }
        }
    }
    let exponential = BASE_RETRY_DELAY * 2u32.saturating_pow(attempt);
    exponential.min(MAX_RETRY_DELAY)
}

/// POST with 429 retry; returns the first non-429 response.
async fn send_with_backoff(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: &Value,
) -> Result<reqwest::Response, GatewayError> {
    let mut attempt = 0u32;
    loop {
        let mut req = client.post(url).timeout(OUTBOUND_TIMEOUT).json(body);
        for (name, value) in headers {
            req = req.header(*name, value);
        }
        let response = req.send().await.map_err(|e| GatewayError::Upstream {
            status: 502,
            message: format!("External API request failed: {}", e),
        })?;

        if response.status().as_u16() == 429 {
            if attempt >= MAX_RETRIES {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::RateLimited(format!(
                    "External API rate limited after {} retries: {}",
                    MAX_RETRIES,
                    crate::util::truncate_utf8_safe(&body, 200)
                )));
            }
            let delay = retry_delay(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok()),
                attempt,
            );
            attempt += 1;
            tracing::warn!(
                "External API 429, retrying in {:?} ({}/{})",
                delay,
                attempt,
                MAX_RETRIES
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        if attempt > 0 {
            tracing::info!("External API retry succeeded (attempt {})", attempt + 1);
        }
        return Ok(response);
    }
}

/// Anthropic-format account serving an Anthropic client: passthrough.
async fn anthropic_outbound(
    state: std::sync::Arc<AppState>,
    account: ExternalApiAccount,
    request: ConversationRequest,
) -> Result<Response, GatewayError> {
    let streaming = request.stream;
    let mut body = normalized_to_anthropic_json(&request, true);
    if account.provider == "azure" {
        clean_request_for_azure(&mut body);
    }

    let url = format!("{}/v1/messages", account.api_base.trim_end_matches('/'));
    let headers = [
        ("x-api-key", account.api_key.clone()),
        ("anthropic-version", "2023-06-01".to_string()),
    ];
    let response = send_with_backoff(&state.http, &url, &headers, &body).await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        state.record_external_outcome(account.id, false);
        return Err(GatewayError::Upstream { status, message: text });
    }

    let account_id = account.id;
    let events = relay_sse_events(response);
    if streaming {
        let state_done = state.clone();
        let stream = with_completion(events, move || {
            state_done.record_external_outcome(account_id, true)
        });
        Ok(sse_response(stream))
    } else {
        let collected: Vec<String> = events.collect().await;
        state.record_external_outcome(account_id, true);
        let message = assemble_anthropic_message(&collected, &request.model);
        Ok(json_response(&message))
    }
}

/// OpenAI-format account serving an Anthropic client: convert both ways.
async fn openai_outbound_to_anthropic(
    state: std::sync::Arc<AppState>,
    account: ExternalApiAccount,
    request: ConversationRequest,
) -> Result<Response, GatewayError> {
    let streaming = request.stream;
    let thinking_enabled = request.thinking.mode != ThinkingMode::Disabled;
    let mut body = normalized_to_openai_json(&request);
    body["stream"] = json!(true);

    let base = account.api_base.trim_end_matches('/');
    let url = if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    };
    let headers = [("authorization", format!("Bearer {}", account.api_key))];
    let response = send_with_backoff(&state.http, &url, &headers, &body).await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        state.record_external_outcome(account.id, false);
        return Err(GatewayError::Upstream { status, message: text });
    }

    let input_tokens = tokens::count_message_tokens(&request.messages_for_tokenizer())
        + tokens::count_tools_tokens(&request.tools_for_tokenizer());
    let events = convert_openai_stream_to_anthropic(
        response.bytes_stream(),
        request.model.clone(),
        input_tokens,
        thinking_enabled,
    );

    let account_id = account.id;
    if streaming {
        let state_done = state.clone();
        let stream = with_completion(events, move || {
            state_done.record_external_outcome(account_id, true)
        });
        Ok(sse_response(stream))
    } else {
        let collected: Vec<String> = Box::pin(events).collect().await;
        state.record_external_outcome(account_id, true);
        let message = assemble_anthropic_message(&collected, &request.model);
        Ok(json_response(&message))
    }
}

/// OpenAI-format account serving an OpenAI client: body passthrough.
async fn openai_passthrough(
    state: std::sync::Arc<AppState>,
    account: ExternalApiAccount,
    request: ConversationRequest,
) -> Result<Response, GatewayError> {
    let streaming = request.stream;
    let body = normalized_to_openai_json(&request);

    let base = account.api_base.trim_end_matches('/');
    let url = if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    };
    let headers = [("authorization", format!("Bearer {}", account.api_key))];
    let response = send_with_backoff(&state.http, &url, &headers, &body).await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        state.record_external_outcome(account.id, false);
        return Err(GatewayError::Upstream {
            status: status.as_u16(),
            message: text,
        });
    }

    let account_id = account.id;
    if streaming {
        let state_done = state.clone();
        let bytes = response
            .bytes_stream()
            .filter_map(|chunk| async move {
                chunk
                    .ok()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
            });
        let stream = with_completion(bytes, move || {
            state_done.record_external_outcome(account_id, true)
        });
        Ok(sse_response(stream))
    } else {
        let body: Value = response.json().await.map_err(|e| GatewayError::Upstream {
            status: 502,
            message: format!("Invalid external response: {}", e),
        })?;
        state.record_external_outcome(account_id, true);
        Ok(json_response(&body))
    }
}

// ────────────────────────────────────────────────────────────────────────
// Stream plumbing
// ────────────────────────────────────────────────────────────────────────

/// Split a byte stream into whole SSE events (separated by blank lines).
fn relay_sse_events(response: reqwest::Response) -> impl Stream<Item = String> + Send {
    stream! {
        let mut buffer = String::new();
        let bytes = response.bytes_stream();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!("External stream error: {}", e);
                    yield error_sse(&format!("external stream error: {}", e), "api_error");
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find("\n\n") {
                let event: String = buffer.drain(..pos + 2).collect();
                if !event.trim().is_empty() {
                    yield event;
                }
            }
        }
        if !buffer.trim().is_empty() {
            yield format!("{}\n\n", buffer.trim_end());
        }
    }
}

fn error_sse(message: &str, error_type: &str) -> String {
    sse_event(
        "error",
        &json!({
            "type": "error",
            "error": {"type": error_type, "message": message},
        }),
    )
}

// ────────────────────────────────────────────────────────────────────────
// OpenAI SSE → Anthropic SSE conversion
// ────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PartialOpenAiTool {
    id: String,
    name: String,
    arguments: String,
}

/// Convert an OpenAI chat-completion SSE byte stream into Anthropic SSE.
pub fn convert_openai_stream_to_anthropic(
    bytes: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    model: String,
    input_tokens: u32,
    thinking_enabled: bool,
) -> impl Stream<Item = String> + Send {
    stream! {
        yield message_start_event(&generate_message_id(), &model, input_tokens);

        let mut builder = AnthropicEventBuilder::new();
        let mut thinking = ThinkingStreamHandler::new(thinking_enabled);
        let mut tools: HashMap<u64, PartialOpenAiTool> = HashMap::new();
        let mut tool_order: Vec<u64> = Vec::new();
        let mut finish_reason: Option<String> = None;
        let mut content = String::new();
        let mut buffer = String::new();

        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!("External OpenAI stream error: {}", e);
                    yield error_sse(&format!("external stream error: {}", e), "api_error");
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..pos + 1).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else { continue };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(data) else { continue };
                let choice = &value["choices"][0];

                if let Some(reason) = choice["finish_reason"].as_str() {
                    finish_reason = Some(reason.to_string());
                }
                if let Some(text) = choice["delta"]["content"].as_str() {
                    content.push_str(text);
                    for te in thinking.process(text) {
                        for sse in builder.handle(&te) {
                            yield sse;
                        }
                    }
                }
                if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
                    for call in calls {
                        let index = call["index"].as_u64().unwrap_or(0);
                        if !tools.contains_key(&index) {
                            tool_order.push(index);
                        }
                        let partial = tools.entry(index).or_default();
                        if let Some(id) = call["id"].as_str() {
                            partial.id = id.to_string();
                        }
                        if let Some(name) = call["function"]["name"].as_str() {
                            partial.name = name.to_string();
                        }
                        if let Some(args) = call["function"]["arguments"].as_str() {
                            partial.arguments.push_str(args);
                        }
                    }
                }
            }
        }

        for te in thinking.flush() {
            for sse in builder.handle(&te) {
                yield sse;
            }
        }
        for sse in builder.close_open_blocks() {
            yield sse;
        }

        let has_tools = !tools.is_empty();
        for index in tool_order {
            let Some(partial) = tools.remove(&index) else { continue };
            let call = crate::parser::ToolCall {
                id: if partial.id.is_empty() {
                    format!("toolu_{}", index)
                } else {
                    partial.id
                },
                name: partial.name,
                arguments: partial.arguments,
            };
            for sse in builder.tool_use_block(&call) {
                yield sse;
            }
        }

        let reason = match finish_reason.as_deref() {
            Some("tool_calls") => "tool_use",
            Some("length") => "max_tokens",
            _ if has_tools => "tool_use",
            _ => "end_turn",
        };
        yield message_delta_event(reason, tokens::estimate_tokens(&content));
        yield message_stop_event();
    }
}

/// Rebuild a non-streaming Anthropic `message` from collected SSE events.
pub fn assemble_anthropic_message(events: &[String], model: &str) -> Value {
    let mut message = json!({
        "id": generate_message_id(),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 0, "output_tokens": 0},
    });

    // Accumulators keyed by block index
    let mut text_blocks: HashMap<u64, String> = HashMap::new();
    let mut thinking_blocks: HashMap<u64, String> = HashMap::new();
    let mut tool_blocks: HashMap<u64, (String, String, String)> = HashMap::new();

    for event in events {
        for line in event.lines() {
            let Some(data) = line.strip_prefix("data:") else { continue };
            let Ok(value) = serde_json::from_str::<Value>(data.trim()) else { continue };
            let index = value["index"].as_u64().unwrap_or(0);

            match value["type"].as_str().unwrap_or("") {
                "message_start" => {
                    if let Some(id) = value["message"]["id"].as_str() {
                        message["id"] = json!(id);
                    }
                    if let Some(tokens) = value["message"]["usage"]["input_tokens"].as_u64() {
                        message["usage"]["input_tokens"] = json!(tokens);
                    }
                }
                "content_block_start" => {
                    match value["content_block"]["type"].as_str().unwrap_or("text") {
                        "thinking" => {
                            thinking_blocks.insert(index, String::new());
                        }
                        "tool_use" => {
                            tool_blocks.insert(
                                index,
                                (
                                    value["content_block"]["id"]
                                        .as_str()
                                        .unwrap_or_default()
                                        .to_string(),
                                    value["content_block"]["name"]
                                        .as_str()
                                        .unwrap_or_default()
                                        .to_string(),
                                    String::new(),
                                ),
                            );
                        }
                        _ => {
                            text_blocks.insert(index, String::new());
                        }
                    }
                }
                "content_block_delta" => match value["delta"]["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(block) = text_blocks.get_mut(&index) {
                            block.push_str(value["delta"]["text"].as_str().unwrap_or_default());
                        }
                    }
                    "thinking_delta" => {
                        if let Some(block) = thinking_blocks.get_mut(&index) {
                            block
                                .push_str(value["delta"]["thinking"].as_str().unwrap_or_default());
                        }
                    }
                    "input_json_delta" => {
                        if let Some((_, _, args)) = tool_blocks.get_mut(&index) {
                            args.push_str(
                                value["delta"]["partial_json"].as_str().unwrap_or_default(),
                            );
                        }
                    }
                    _ => {}
                },
                "message_delta" => {
                    if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                        message["stop_reason"] = json!(reason);
                    }
                    if let Some(tokens) = value["usage"]["output_tokens"].as_u64() {
                        message["usage"]["output_tokens"] = json!(tokens);
                    }
                }
                _ => {}
            }
        }
    }

    let mut indices: Vec<u64> = text_blocks
        .keys()
        .chain(thinking_blocks.keys())
        .chain(tool_blocks.keys())
        .copied()
        .collect();
    indices.sort_unstable();
    indices.dedup();

    let mut content = Vec::new();
    for index in indices {
        if let Some(thinking) = thinking_blocks.remove(&index) {
            content.push(json!({"type": "thinking", "thinking": thinking}));
        }
        if let Some(text) = text_blocks.remove(&index) {
            content.push(json!({"type": "text", "text": text}));
        }
        if let Some((id, name, args)) = tool_blocks.remove(&index) {
            let input: Value = serde_json::from_str(&args).unwrap_or_else(|_| json!({}));
            content.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
        }
    }
    message["content"] = json!(content);
    message
}

// ────────────────────────────────────────────────────────────────────────
// Outbound request shapes
// ────────────────────────────────────────────────────────────────────────

/// Serialize a normalized request into the OpenAI wire shape.
pub fn normalized_to_openai_json(request: &ConversationRequest) -> Value {
    let mut messages = Vec::new();
    for msg in &request.messages {
        match msg.role {
            Role::System => {
                messages.push(json!({"role": "system", "content": msg.content.text()}));
            }
            Role::Assistant => {
                let mut entry = json!({"role": "assistant"});
                let text = msg.content.text();
                entry["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                let tool_calls = collect_tool_calls(&msg.content);
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = json!(tool_calls);
                }
                messages.push(entry);
            }
            Role::User | Role::Tool => {
                let mut pushed_tool_result = false;
                if let MessageContent::Parts(parts) = &msg.content {
                    for part in parts {
                        if let ContentPart::ToolResult { tool_use_id, content } = part {
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                            pushed_tool_result = true;
                        }
                    }
                }
                let text = msg.content.text();
                if !text.is_empty() || !pushed_tool_result {
                    messages.push(json!({"role": "user", "content": text}));
                }
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": request.stream,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop"] = json!(request.stop_sequences);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Specific(name) => json!({
                "type": "function",
                "function": {"name": name},
            }),
        };
    }
    body
}

fn collect_tool_calls(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { id, name, input } => Some(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": input.to_string()},
                })),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Serialize a normalized request into the Anthropic wire shape.
pub fn normalized_to_anthropic_json(request: &ConversationRequest, stream: bool) -> Value {
    let mut system = String::new();
    let mut messages = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&msg.content.text());
            }
            _ => {
                let role = if msg.role == Role::Assistant { "assistant" } else { "user" };
                let content = match &msg.content {
                    MessageContent::Text(text) => json!(text),
                    MessageContent::Parts(parts) => {
                        let blocks: Vec<Value> = parts
                            .iter()
                            .map(|p| match p {
                                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                                ContentPart::Image { format, data } => json!({
                                    "type": "image",
                                    "source": {
                                        "type": "base64",
                                        "media_type": format!("image/{}", format),
                                        "data": data,
                                    },
                                }),
                                ContentPart::ToolUse { id, name, input } => json!({
                                    "type": "tool_use",
                                    "id": id,
                                    "name": name,
                                    "input": input,
                                }),
                                ContentPart::ToolResult { tool_use_id, content } => json!({
                                    "type": "tool_result",
                                    "tool_use_id": tool_use_id,
                                    "content": content,
                                }),
                            })
                            .collect();
                        json!(blocks)
                    }
                };
                messages.push(json!({"role": role, "content": content}));
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(4096),
        "stream": stream,
    });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(request.stop_sequences);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Required => json!({"type": "any"}),
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Specific(name) => json!({"type": "tool", "name": name}),
        };
    }
    if request.thinking.mode == ThinkingMode::Enabled {
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": request.thinking.budget_tokens.unwrap_or(16_000),
        });
    }
    body
}

/// Prune fields some hosted variants reject: thinking blocks without a
/// signature, and empty text blocks.
pub fn clean_request_for_azure(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    for message in messages {
        let Some(blocks) = message.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };
        blocks.retain(|block| match block.get("type").and_then(|t| t.as_str()) {
            Some("thinking") => block
                .get("signature")
                .and_then(|s| s.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false),
            Some("text") => block
                .get("text")
                .and_then(|t| t.as_str())
                .map(|t| !t.is_empty())
                .unwrap_or(true),
            _ => true,
        });
    }
}
