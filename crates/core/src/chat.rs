//! Chat message types and the manual role-tag formatter.

use serde::{Deserialize, Serialize};

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }
}

/// A preference field: either plain text or an already structured conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl ChatContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Messages(messages) => messages.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Messages(_) => None,
        }
    }

    /// Wrap plain text as a single message with `role`.
    pub fn into_messages(self, role: &str) -> Vec<ChatMessage> {
        match self {
            Self::Text(text) => vec![ChatMessage::new(role, text)],
            Self::Messages(messages) => messages,
        }
    }
}

impl From<&str> for ChatContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Render messages with `[INST]` / `<<SYS>>` role tags.
///
/// Used whenever the tokenizer has no chat template. Assistant content is
/// appended verbatim and unknown roles are dropped.
pub fn format_chat(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        match message.role.as_str() {
            "user" => {
                out.push_str("[INST] ");
                out.push_str(&message.content);
                out.push_str(" [/INST] ");
            }
            "system" => {
                out.push_str("<<SYS>> ");
                out.push_str(&message.content);
                out.push_str(" <</SYS>> ");
            }
            "assistant" => out.push_str(&message.content),
            _ => {}
        }
    }
    out
}
