//! Normalized request → upstream payload
//!
//! The upstream expects a `conversationState` envelope:
//!
//! ```text
//! {conversationState: {
//!    chatTriggerType: "MANUAL",
//!    conversationId,
//!    currentMessage: {userInputMessage: {content, modelId, origin, images?,
//!                                        userInputMessageContext?}},
//!    history: [{userInputMessage}|{assistantResponseMessage}, ...]
//!  },
//!  profileArn?}
//! ```
//!
//! The upstream rejects consecutive same-role turns and has no system
//! field, so system text rides in a synthetic user/assistant pair at the
//! front of history.

use serde_json::{json, Value};

use super::{ContentPart, ConversationRequest, Message, MessageContent, Role, ThinkingMode};

/// Default thinking budget when the client enables thinking without one.
pub const THINKING_DEFAULT_BUDGET: u32 = 16_000;
/// Hard cap on the thinking budget hint.
pub const THINKING_MAX_BUDGET: u32 = 24_576;

/// Substitute user content when the conversation would otherwise end on
/// an assistant turn or with empty content.
pub const CONTINUE_MESSAGE: &str = "Continue";

/// Assistant acknowledgement closing the system-injection pair.
pub const SYSTEM_ACK: &str = "I will follow these instructions.";

/// Fixed policy appended after the system text. Instructs the model to
/// respect upstream tool content-size limits without narrating it.
pub const CHUNKING_POLICY: &str = "If any tool output or file content exceeds the size limit, \
process it in sequential chunks and continue until complete. Comply with this silently; never \
mention chunking or content limits in your replies.";

/// Knobs the payload builder needs from configuration.
pub struct PayloadOptions<'a> {
    pub conversation_id: &'a str,
    pub profile_arn: Option<&'a str>,
    pub tool_description_max_length: usize,
}

/// Build the upstream request payload.
pub fn build_upstream_payload(
    request: &ConversationRequest,
    opts: &PayloadOptions<'_>,
) -> Value {
    // Split out system text; retag tool-role turns as user so folding
    // reduces to the adjacent same-role merge.
    let mut system_text = String::new();
    let mut conversation: Vec<Message> = Vec::new();
    for msg in &request.messages {
        match msg.role {
            Role::System => {
                let text = msg.content.text();
                if !text.is_empty() {
                    if !system_text.is_empty() {
                        system_text.push('\n');
                    }
                    system_text.push_str(&text);
                }
            }
            Role::Tool => {
                let mut clone = msg.clone();
                clone.role = Role::User;
                conversation.push(clone);
            }
            _ => conversation.push(msg.clone()),
        }
    }

    let merged = merge_adjacent_same_role(conversation);

    // Tool definitions; oversized descriptions are relocated into the
    // system prompt so the upstream's per-tool limit is not exceeded.
    let (tool_specs, relocated_docs) =
        build_tool_specs(request, opts.tool_description_max_length);
    if !relocated_docs.is_empty() {
        if !system_text.is_empty() {
            system_text.push_str("\n\n");
        }
        system_text.push_str("# Tool Documentation\n");
        system_text.push_str(&relocated_docs);
    }

    let mut history: Vec<Value> = Vec::new();

    // System + thinking-hint injection pair
    let hint = if system_text.contains("<thinking_mode>") {
        None
    } else {
        thinking_hint(request)
    };
    let injected_user_content = match (&hint, system_text.is_empty()) {
        (Some(hint), false) => Some(format!("{}\n{}\n{}", hint, system_text, CHUNKING_POLICY)),
        (None, false) => Some(format!("{}\n{}", system_text, CHUNKING_POLICY)),
        (Some(hint), true) => Some(hint.clone()),
        (None, true) => None,
    };
    if let Some(content) = injected_user_content {
        history.push(json!({
            "userInputMessage": {
                "content": content,
                "modelId": request.model,
                "origin": "AI_EDITOR",
            }
        }));
        history.push(json!({
            "assistantResponseMessage": {
                "content": SYSTEM_ACK,
            }
        }));
    }

    // All but the final merged message become history; the final one
    // becomes currentMessage unless it is an assistant turn.
    let mut messages = merged;
    let mut current = messages.pop();

    if let Some(last) = &current {
        if last.role == Role::Assistant {
            messages.push(last.clone());
            current = None;
        }
    }

    for msg in &messages {
        history.push(history_entry(msg, &request.model));
    }

    let current_message = current_user_message(current.as_ref(), request, tool_specs);

    let mut payload = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": opts.conversation_id,
            "currentMessage": current_message,
            "history": history,
        }
    });
    if let Some(arn) = opts.profile_arn {
        if !arn.is_empty() {
            payload["profileArn"] = json!(arn);
        }
    }
    payload
}

/// Merge consecutive messages that share a role. The upstream rejects
/// consecutive same-role turns.
fn merge_adjacent_same_role(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::new();
    for msg in messages {
        match merged.last_mut() {
            Some(last) if last.role == msg.role => last.merge(msg),
            _ => merged.push(msg),
        }
    }
    merged
}

/// Thinking hint per the request's thinking config.
fn thinking_hint(request: &ConversationRequest) -> Option<String> {
    match request.thinking.mode {
        ThinkingMode::Enabled => {
            let budget = request
                .thinking
                .budget_tokens
                .unwrap_or(THINKING_DEFAULT_BUDGET)
                .min(THINKING_MAX_BUDGET);
            Some(format!(
                "<thinking_mode>enabled</thinking_mode><max_thinking_length>{}</max_thinking_length>",
                budget
            ))
        }
        ThinkingMode::Adaptive => {
            let effort = request.thinking.effort.as_deref().unwrap_or("medium");
            Some(format!(
                "<thinking_mode>adaptive</thinking_mode><thinking_effort>{}</thinking_effort>",
                effort
            ))
        }
        ThinkingMode::Disabled => None,
    }
}

/// One history entry for a merged message.
fn history_entry(msg: &Message, model: &str) -> Value {
    match msg.role {
        Role::Assistant => {
            let mut entry = json!({
                "assistantResponseMessage": {
                    "content": msg.content.text(),
                }
            });
            let tool_uses = tool_uses_of(msg);
            if !tool_uses.is_empty() {
                entry["assistantResponseMessage"]["toolUses"] = json!(tool_uses);
            }
            entry
        }
        _ => {
            let mut content = msg.content.text();
            // Images never ride in history; only the placeholder survives
            let image_count = images_of(msg).len();
            if image_count > 0 {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(
                    &super::anthropic::HISTORY_IMAGE_PLACEHOLDER
                        .replacen("{}", &image_count.to_string(), 1),
                );
            }
            let mut entry = json!({
                "userInputMessage": {
                    "content": content,
                    "modelId": model,
                    "origin": "AI_EDITOR",
                }
            });
            let tool_results = tool_results_of(msg);
            if !tool_results.is_empty() {
                entry["userInputMessage"]["userInputMessageContext"] =
                    json!({ "toolResults": tool_results });
            }
            entry
        }
    }
}

/// The currentMessage envelope. `current` is None when the conversation
/// ended on an assistant turn (or was empty); the literal "Continue"
/// stands in.
fn current_user_message(
    current: Option<&Message>,
    request: &ConversationRequest,
    tool_specs: Vec<Value>,
) -> Value {
    let mut content = current.map(|m| m.content.text()).unwrap_or_default();
    if content.is_empty() {
        content = CONTINUE_MESSAGE.to_string();
    }

    let mut user_input = json!({
        "content": content,
        "modelId": request.model,
        "origin": "AI_EDITOR",
    });

    if let Some(msg) = current {
        let images = images_of(msg);
        if !images.is_empty() {
            user_input["images"] = json!(images);
        }
    }

    let mut context = serde_json::Map::new();
    if !tool_specs.is_empty() {
        context.insert("tools".to_string(), json!(tool_specs));
    }
    if let Some(msg) = current {
        let tool_results = tool_results_of(msg);
        if !tool_results.is_empty() {
            context.insert("toolResults".to_string(), json!(tool_results));
        }
    }
    if !context.is_empty() {
        user_input["userInputMessageContext"] = Value::Object(context);
    }

    json!({ "userInputMessage": user_input })
}

/// Tool specifications plus relocated documentation for oversized
/// descriptions.
fn build_tool_specs(request: &ConversationRequest, max_len: usize) -> (Vec<Value>, String) {
    let mut specs = Vec::new();
    let mut relocated = String::new();

    for tool in &request.tools {
        let description = if tool.description.len() > max_len {
            relocated.push_str(&format!("\n## Tool: {}\n{}\n", tool.name, tool.description));
            format!(
                "[Full documentation in system prompt under '## Tool: {}']",
                tool.name
            )
        } else {
            tool.description.clone()
        };

        specs.push(json!({
            "toolSpecification": {
                "name": tool.name,
                "description": description,
                "inputSchema": { "json": tool.input_schema },
            }
        }));
    }

    (specs, relocated)
}

fn tool_uses_of(msg: &Message) -> Vec<Value> {
    match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { id, name, input } => Some(json!({
                    "toolUseId": id,
                    "name": name,
                    "input": input,
                })),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn tool_results_of(msg: &Message) -> Vec<Value> {
    match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult { tool_use_id, content } => Some(json!({
                    "content": [{ "text": content }],
                    "status": "success",
                    "toolUseId": tool_use_id,
                })),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn images_of(msg: &Message) -> Vec<Value> {
    match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Image { format, data } => Some(json!({
                    "format": format,
                    "source": { "bytes": data },
                })),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
