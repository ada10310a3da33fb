//! UI-agnostic conversation state types
//!
//! The transcript is owned by the session; render code only ever sees the
//! filtered view returned by [`Transcript::visible`].

use serde::{Deserialize, Serialize};

/// A single message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// The role of a chat message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Ordered conversation history, seeded with exactly one system message.
///
/// Append-only: messages are never removed or reordered, and the system
/// message cannot be added after construction.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt)],
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    /// Full history including the system message, as sent to the engine
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Messages shown to the user (system message excluded)
    pub fn visible(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != ChatRole::System)
    }

    pub fn visible_len(&self) -> usize {
        self.messages.len() - 1
    }

    /// Message count including the system message
    #[cfg(test)]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}
