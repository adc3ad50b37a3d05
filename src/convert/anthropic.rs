//! Anthropic Messages request parsing and normalization
//!
//! Converts the Anthropic Messages API shape into [`ConversationRequest`].
//!
//! Notable behaviors:
//! - `system` may be a string or a list of text blocks; both concatenate
//! - images survive only on the final (current) turn; older turns get a
//!   placeholder so the upstream payload stays small
//! - `thinking` blocks are re-wrapped in `<thinking>` tags so the
//!   streaming thinking parser re-detects them on the way back
//! - `web_search`-typed tools are handled elsewhere and skipped here

use serde::Deserialize;
use serde_json::Value;

use super::schema::normalize_tool_schema;
use super::{
    ContentPart, ConversationRequest, Message, MessageContent, Role, ThinkingConfig, ThinkingMode,
    ToolChoice, ToolDefinition,
};

/// Placeholder substituted for images in historical turns.
pub const HISTORY_IMAGE_PLACEHOLDER: &str = "[此消息包含 {} 张图片，已在历史记录中省略]";

// ============================================================================
// Anthropic Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AnthropicMessagesRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub system: Option<AnthropicSystem>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    pub tool_choice: Option<AnthropicToolChoice>,
    #[serde(default)]
    pub thinking: Option<AnthropicThinking>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicSystemBlock>),
}

#[derive(Debug, Deserialize)]
pub struct AnthropicSystemBlock {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: AnthropicImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<AnthropicToolResultContent>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(rename = "redacted_thinking")]
    RedactedThinking {
        #[serde(default)]
        #[allow(dead_code)]
        data: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AnthropicImageSource {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub source_type: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicToolResultContent {
    Text(String),
    Blocks(Vec<AnthropicToolResultBlock>),
}

#[derive(Debug, Deserialize)]
pub struct AnthropicToolResultBlock {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(rename = "type", default)]
    pub tool_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicToolChoice {
    #[serde(rename = "type")]
    pub choice_type: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicThinking {
    #[serde(rename = "type")]
    pub thinking_type: String,
    #[serde(default)]
    pub budget_tokens: Option<u32>,
    #[serde(default)]
    pub effort: Option<String>,
}

// ============================================================================
// Conversion
// ============================================================================

/// Convert an Anthropic Messages request to the normalized shape.
pub fn normalize_anthropic_request(request: AnthropicMessagesRequest) -> ConversationRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(Message::text(Role::System, text));
        }
    }

    let last_index = request.messages.len().saturating_sub(1);
    for (index, msg) in request.messages.into_iter().enumerate() {
        let role = match msg.role.as_str() {
            "assistant" => Role::Assistant,
            _ => Role::User,
        };
        let keep_images = index == last_index;
        messages.push(Message {
            role,
            content: convert_content(msg.content, keep_images),
        });
    }

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .filter(|t| {
            // web_search variants are handled outside the translation core
            !t.tool_type
                .as_deref()
                .map(|ty| ty.starts_with("web_search"))
                .unwrap_or(false)
        })
        .map(|t| ToolDefinition {
            name: t.name,
            description: t.description.unwrap_or_default(),
            input_schema: normalize_tool_schema(&t.input_schema),
        })
        .collect();

    let tool_choice = request.tool_choice.map(|choice| match choice.choice_type.as_str() {
        "any" => ToolChoice::Required,
        "tool" => ToolChoice::Specific(choice.name.unwrap_or_default()),
        "none" => ToolChoice::None,
        _ => ToolChoice::Auto,
    });

    let thinking = request
        .thinking
        .map(|t| ThinkingConfig {
            mode: match t.thinking_type.as_str() {
                "enabled" => ThinkingMode::Enabled,
                "adaptive" => ThinkingMode::Adaptive,
                _ => ThinkingMode::Disabled,
            },
            budget_tokens: t.budget_tokens,
            effort: t.effort,
        })
        .unwrap_or_default();

    ConversationRequest {
        model: request.model,
        messages,
        tools,
        tool_choice,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop_sequences.unwrap_or_default(),
        stream: request.stream.unwrap_or(false),
        thinking,
    }
}

fn system_text(system: &AnthropicSystem) -> String {
    match system {
        AnthropicSystem::Text(s) => s.clone(),
        AnthropicSystem::Blocks(blocks) => blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn convert_content(content: AnthropicContent, keep_images: bool) -> MessageContent {
    let blocks = match content {
        AnthropicContent::Text(text) => return MessageContent::Text(text),
        AnthropicContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    let image_count = blocks
        .iter()
        .filter(|b| matches!(b, AnthropicContentBlock::Image { .. }))
        .count();
    let mut placeholder_emitted = false;

    for block in blocks {
        match block {
            AnthropicContentBlock::Text { text } => {
                parts.push(ContentPart::Text { text });
            }
            AnthropicContentBlock::Image { source } => {
                if keep_images {
                    parts.push(ContentPart::Image {
                        format: image_format(&source.media_type),
                        data: source.data,
                    });
                } else if !placeholder_emitted {
                    // One placeholder per message regardless of image count
                    parts.push(ContentPart::Text {
                        text: HISTORY_IMAGE_PLACEHOLDER.replacen("{}", &image_count.to_string(), 1),
                    });
                    placeholder_emitted = true;
                }
            }
            AnthropicContentBlock::ToolUse { id, name, input } => {
                parts.push(ContentPart::ToolUse { id, name, input });
            }
            AnthropicContentBlock::ToolResult { tool_use_id, content } => {
                parts.push(ContentPart::ToolResult {
                    tool_use_id,
                    content: tool_result_text(content),
                });
            }
            AnthropicContentBlock::Thinking { thinking } => {
                // Re-wrap so the streaming thinking parser can re-detect
                parts.push(ContentPart::Text {
                    text: format!("<thinking>{}</thinking>", thinking),
                });
            }
            AnthropicContentBlock::RedactedThinking { .. } => {}
        }
    }

    MessageContent::Parts(parts)
}

fn tool_result_text(content: Option<AnthropicToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(AnthropicToolResultContent::Text(s)) => s,
        Some(AnthropicToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn image_format(media_type: &str) -> String {
    media_type
        .strip_prefix("image/")
        .unwrap_or("png")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> ConversationRequest {
        let request: AnthropicMessagesRequest = serde_json::from_str(body).unwrap();
        normalize_anthropic_request(request)
    }

    #[test]
    fn test_simple_request() {
        let normalized = parse(
            r#"{
                "model": "claude-sonnet-4",
                "max_tokens": 100,
                "system": "You are helpful",
                "messages": [{"role": "user", "content": "Hi"}]
            }"#,
        );
        assert_eq!(normalized.model, "claude-sonnet-4");
        assert_eq!(normalized.messages.len(), 2);
        assert_eq!(normalized.messages[0].role, Role::System);
        assert_eq!(normalized.messages[0].content.text(), "You are helpful");
        assert_eq!(normalized.messages[1].content.text(), "Hi");
        assert!(!normalized.thinking.is_enabled());
    }

    #[test]
    fn test_system_block_list() {
        let normalized = parse(
            r#"{
                "model": "m",
                "messages": [{"role": "user", "content": "x"}],
                "system": [
                    {"type": "text", "text": "one"},
                    {"type": "text", "text": "two"}
                ]
            }"#,
        );
        assert_eq!(normalized.messages[0].content.text(), "one\ntwo");
    }

    #[test]
    fn test_tool_use_and_result() {
        let normalized = parse(
            r#"{
                "model": "m",
                "messages": [
                    {"role": "user", "content": "weather?"},
                    {"role": "assistant", "content": [
                        {"type": "tool_use", "id": "t1", "name": "get_weather", "input": {"city": "London"}}
                    ]},
                    {"role": "user", "content": [
                        {"type": "tool_result", "tool_use_id": "t1", "content": "Sunny"},
                        {"type": "text", "text": "and then?"}
                    ]}
                ]
            }"#,
        );

        match &normalized.messages[1].content {
            MessageContent::Parts(parts) => {
                assert!(matches!(parts[0], ContentPart::ToolUse { .. }));
            }
            _ => panic!("expected parts"),
        }
        // Sibling text next to the tool result is not dropped
        match &normalized.messages[2].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0], ContentPart::ToolResult { .. }));
                assert!(matches!(parts[1], ContentPart::Text { .. }));
            }
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn test_tool_result_block_content() {
        let normalized = parse(
            r#"{
                "model": "m",
                "messages": [
                    {"role": "user", "content": [
                        {"type": "tool_result", "tool_use_id": "t1", "content": [
                            {"type": "text", "text": "line1"},
                            {"type": "text", "text": "line2"}
                        ]}
                    ]}
                ]
            }"#,
        );
        match &normalized.messages[0].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::ToolResult { content, .. } => assert_eq!(content, "line1\nline2"),
                other => panic!("unexpected part {:?}", other),
            },
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn test_thinking_block_rewrapped() {
        let normalized = parse(
            r#"{
                "model": "m",
                "messages": [
                    {"role": "assistant", "content": [
                        {"type": "thinking", "thinking": "let me think", "signature": "sig"}
                    ]},
                    {"role": "user", "content": "go on"}
                ]
            }"#,
        );
        assert_eq!(
            normalized.messages[0].content.text(),
            "<thinking>let me think</thinking>"
        );
    }

    #[test]
    fn test_images_kept_on_current_turn_only() {
        let normalized = parse(
            r#"{
                "model": "m",
                "messages": [
                    {"role": "user", "content": [
                        {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAA"}},
                        {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "BBB"}},
                        {"type": "text", "text": "old"}
                    ]},
                    {"role": "user", "content": [
                        {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "CCC"}},
                        {"type": "text", "text": "new"}
                    ]}
                ]
            }"#,
        );

        // Old turn: placeholder with the image count, images dropped
        match &normalized.messages[0].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                match &parts[0] {
                    ContentPart::Text { text } => {
                        assert_eq!(text, "[此消息包含 2 张图片，已在历史记录中省略]")
                    }
                    other => panic!("unexpected part {:?}", other),
                }
            }
            _ => panic!("expected parts"),
        }
        // Current turn: image preserved
        match &normalized.messages[1].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::Image { format, data } => {
                    assert_eq!(format, "jpeg");
                    assert_eq!(data, "CCC");
                }
                other => panic!("unexpected part {:?}", other),
            },
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn test_web_search_tools_skipped() {
        let normalized = parse(
            r#"{
                "model": "m",
                "messages": [{"role": "user", "content": "x"}],
                "tools": [
                    {"name": "web_search", "type": "web_search_20250305", "input_schema": {}},
                    {"name": "get_weather", "input_schema": {"type": "object"}}
                ]
            }"#,
        );
        assert_eq!(normalized.tools.len(), 1);
        assert_eq!(normalized.tools[0].name, "get_weather");
    }

    #[test]
    fn test_tool_choice_mapping() {
        for (wire, expected) in [
            (r#"{"type": "auto"}"#, ToolChoice::Auto),
            (r#"{"type": "any"}"#, ToolChoice::Required),
            (r#"{"type": "none"}"#, ToolChoice::None),
            (
                r#"{"type": "tool", "name": "get_weather"}"#,
                ToolChoice::Specific("get_weather".to_string()),
            ),
        ] {
            let body = format!(
                r#"{{"model":"m","messages":[{{"role":"user","content":"x"}}],"tool_choice":{}}}"#,
                wire
            );
            let normalized = parse(&body);
            assert_eq!(normalized.tool_choice, Some(expected));
        }
    }

    #[test]
    fn test_thinking_config() {
        let normalized = parse(
            r#"{
                "model": "m",
                "messages": [{"role": "user", "content": "x"}],
                "thinking": {"type": "enabled", "budget_tokens": 10000}
            }"#,
        );
        assert_eq!(normalized.thinking.mode, ThinkingMode::Enabled);
        assert_eq!(normalized.thinking.budget_tokens, Some(10000));

        let adaptive = parse(
            r#"{
                "model": "m",
                "messages": [{"role": "user", "content": "x"}],
                "thinking": {"type": "adaptive", "effort": "high"}
            }"#,
        );
        assert_eq!(adaptive.thinking.mode, ThinkingMode::Adaptive);
        assert_eq!(adaptive.thinking.effort.as_deref(), Some("high"));
    }

    #[test]
    fn test_stop_sequences() {
        let normalized = parse(
            r#"{
                "model": "m",
                "messages": [{"role": "user", "content": "x"}],
                "stop_sequences": ["END", "STOP"]
            }"#,
        );
        assert_eq!(normalized.stop_sequences, vec!["END", "STOP"]);
    }
}
