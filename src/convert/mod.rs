//! Format converters - three-way conversion between client and upstream shapes
//!
//! Client requests arrive in the OpenAI Chat Completions shape or the
//! Anthropic Messages shape. Both are converted to a wire-independent
//! [`ConversationRequest`] and from there to the upstream envelope.
//!
//! ```text
//! OpenAI request ──┐
//!                  ├─> ConversationRequest ──> upstream payload
//! Anthropic request┘
//! ```
//!
//! Content is a tagged union ([`ContentPart`]), never a free-form map;
//! dropping an unknown part is an explicit decision in each converter.

pub mod anthropic;
pub mod openai;
pub mod schema;
pub mod upstream;

use serde_json::Value;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One typed piece of message content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        /// Image format, e.g. "png" or "jpeg"
        format: String,
        /// Base64 payload
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// Message content: plain text or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    fn into_parts(self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(s) => {
                if s.is_empty() {
                    Vec::new()
                } else {
                    vec![ContentPart::Text { text: s }]
                }
            }
            MessageContent::Parts(parts) => parts,
        }
    }
}

/// A normalized conversation message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Merge another same-role message into this one.
    ///
    /// Text content concatenates with a newline; list content concatenates;
    /// mixed content degrades to parts.
    pub fn merge(&mut self, other: Message) {
        debug_assert_eq!(self.role, other.role);
        match (&mut self.content, other.content) {
            (MessageContent::Text(a), MessageContent::Text(b)) => {
                if !b.is_empty() {
                    if !a.is_empty() {
                        a.push('\n');
                    }
                    a.push_str(&b);
                }
            }
            (MessageContent::Parts(a), content) => {
                a.extend(content.into_parts());
            }
            (content @ MessageContent::Text(_), MessageContent::Parts(b)) => {
                let mut parts = std::mem::replace(content, MessageContent::Parts(Vec::new()))
                    .into_parts();
                parts.extend(b);
                *content = MessageContent::Parts(parts);
            }
        }
    }
}

/// A tool definition with a normalized JSON schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// How the model may choose tools.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    Required,
    None,
    Specific(String),
}

/// Extended-thinking configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingMode {
    #[default]
    Disabled,
    Enabled,
    Adaptive,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThinkingConfig {
    pub mode: ThinkingMode,
    pub budget_tokens: Option<u32>,
    pub effort: Option<String>,
}

impl ThinkingConfig {
    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, ThinkingMode::Enabled | ThinkingMode::Adaptive)
    }
}

/// Wire-independent request shape both client dialects normalize into.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop_sequences: Vec<String>,
    pub stream: bool,
    pub thinking: ThinkingConfig,
}

impl ConversationRequest {
    /// Request messages as JSON values for local token counting.
    pub fn messages_for_tokenizer(&self) -> Vec<Value> {
        self.messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::Tool => "tool",
                    },
                    "content": m.content.text(),
                })
            })
            .collect()
    }

    /// Tool definitions as JSON values for local token counting.
    pub fn tools_for_tokenizer(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect()
    }
}
