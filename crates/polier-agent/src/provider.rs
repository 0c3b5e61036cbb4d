//! Provider boundary types.
//!
//! The conversational-model provider returns an ordered list of content
//! blocks. Everything crossing that boundary is normalized into the
//! closed [`ContentBlock`] union here; unrecognized shapes survive as
//! `Opaque` values so they can be echoed back verbatim in later rounds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One normalized provider content block.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    Opaque(Value),
}

impl ContentBlock {
    /// Normalize a raw provider block. Anything that is not a well-formed
    /// `text` or `tool_use` block is preserved best-effort as `Opaque`.
    pub fn from_value(raw: &Value) -> Self {
        match raw.get("type").and_then(Value::as_str) {
            Some("text") => match raw.get("text").and_then(Value::as_str) {
                Some(text) => Self::Text {
                    text: text.to_string(),
                },
                None => Self::Opaque(raw.clone()),
            },
            Some("tool_use") => Self::ToolUse {
                id: raw
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: raw
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: raw.get("input").cloned().unwrap_or_else(|| json!({})),
            },
            _ => Self::Opaque(raw.clone()),
        }
    }

    /// Wire representation of this block.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text { text } => json!({ "type": "text", "text": text }),
            Self::ToolUse { id, name, input } => json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            Self::Opaque(raw) => raw.clone(),
        }
    }
}

/// Result of one tool call, correlated back by the originating id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResultBlock {
    pub fn to_value(&self) -> Value {
        json!({
            "type": "tool_result",
            "tool_use_id": self.tool_use_id,
            "content": self.content,
            "is_error": self.is_error,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
    ToolResults(Vec<ToolResultBlock>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
            Self::ToolResults(results) => results.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderMessage {
    pub role: MessageRole,
    pub content: MessageContent,
}

impl ProviderMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// Declared tool surface sent alongside a completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ProviderMessage>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
}

/// A single non-streaming completion round trip.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}
