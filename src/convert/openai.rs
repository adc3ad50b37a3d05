//! OpenAI Chat Completions request parsing and normalization
//!
//! The OpenAI shape is already close to the normalized model: system
//! messages stay in the message list, assistant `tool_calls` become
//! tool-use parts, and `tool`-role messages become user messages
//! carrying a tool result keyed by `tool_call_id`.

use serde::Deserialize;
use serde_json::Value;

use super::schema::normalize_tool_schema;
use super::{
    ContentPart, ConversationRequest, Message, MessageContent, Role, ThinkingConfig, ThinkingMode,
    ToolChoice, ToolDefinition,
};

// ============================================================================
// OpenAI Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenAiChatRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Option<StopSequence>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub tools: Option<Vec<OpenAiTool>>,
    #[serde(default)]
    pub tool_choice: Option<OpenAiToolChoice>,
    /// Extension accepted from OpenAI-shaped clients
    #[serde(default)]
    pub thinking: Option<OpenAiThinking>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<OpenAiContent>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum OpenAiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StopSequence {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiFunction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OpenAiToolChoice {
    Mode(String),
    Specific {
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiThinking {
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

/// Convert an OpenAI Chat Completions request to the normalized shape.
pub fn normalize_openai_request(request: OpenAiChatRequest) -> ConversationRequest {
    let mut messages = Vec::new();

    for msg in request.messages {
        messages.push(convert_message(msg));
    }

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t.tool_type == "function")
        .map(|t| ToolDefinition {
            name: t.function.name,
            description: t.function.description.unwrap_or_default(),
            input_schema: normalize_tool_schema(
                &t.function.parameters.unwrap_or(Value::Null),
            ),
        })
        .collect();

    let tool_choice = request.tool_choice.map(|choice| match choice {
        OpenAiToolChoice::Mode(mode) => match mode.as_str() {
            "required" => ToolChoice::Required,
            "none" => ToolChoice::None,
            _ => ToolChoice::Auto,
        },
        OpenAiToolChoice::Specific { function } => ToolChoice::Specific(function.name),
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
        stop_sequences: match request.stop {
            Some(StopSequence::Single(s)) => vec![s],
            Some(StopSequence::Multiple(v)) => v,
            None => Vec::new(),
        },
        stream: request.stream.unwrap_or(false),
        thinking,
    }
}

fn convert_message(msg: OpenAiMessage) -> Message {
    // tool-role messages become user messages carrying the result
    if msg.role == "tool" {
        let content = content_text(msg.content);
        return Message {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: msg.tool_call_id.unwrap_or_default(),
                content,
            }]),
        };
    }

    let role = match msg.role.as_str() {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        _ => Role::User,
    };

    if let Some(tool_calls) = msg.tool_calls {
        let mut parts = Vec::new();
        let text = content_text(msg.content);
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        for call in tool_calls {
            let input: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| {
                    serde_json::json!({})
                });
            parts.push(ContentPart::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
        return Message {
            role,
            content: MessageContent::Parts(parts),
        };
    }

    match msg.content {
        Some(OpenAiContent::Text(text)) => Message {
            role,
            content: MessageContent::Text(text),
        },
        Some(OpenAiContent::Parts(parts)) => {
            let converted = parts
                .into_iter()
                .filter_map(|part| match part {
                    OpenAiContentPart::Text { text } => Some(ContentPart::Text { text }),
                    OpenAiContentPart::ImageUrl { image_url } => {
                        convert_data_url(&image_url.url)
                    }
                })
                .collect();
            Message {
                role,
                content: MessageContent::Parts(converted),
            }
        }
        None => Message {
            role,
            content: MessageContent::Text(String::new()),
        },
    }
}

fn content_text(content: Option<OpenAiContent>) -> String {
    match content {
        Some(OpenAiContent::Text(text)) => text,
        Some(OpenAiContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                OpenAiContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

/// Convert a `data:image/png;base64,...` URL to an image part.
///
/// External URLs cannot be fetched here and are dropped with a warning.
fn convert_data_url(url: &str) -> Option<ContentPart> {
    if let Some(rest) = url.strip_prefix("data:") {
        let mut split = rest.splitn(2, ',');
        let header = split.next()?;
        let data = split.next()?;
        let format = header
            .split(';')
            .next()
            .and_then(|mt| mt.strip_prefix("image/"))
            .unwrap_or("png");
        return Some(ContentPart::Image {
            format: format.to_string(),
            data: data.to_string(),
        });
    }
    tracing::warn!("Dropping external image URL (base64 required): {}", url);
    None
}
