//! Conversation history handed to the engine by the caller
//!
//! Persistence is the surrounding application's concern; the engine only
//! needs the recent messages and a truncation policy for prompt size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A single message in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn role_label(&self) -> &'static str {
        match self.role {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
            MessageRole::System => "System",
        }
    }
}

/// Truncation policy: keep the newest `max_messages`, drop oldest first.
#[derive(Debug, Clone, Copy)]
pub struct HistoryWindow {
    pub max_messages: usize,
}

impl HistoryWindow {
    pub fn new(max_messages: usize) -> Self {
        Self { max_messages }
    }

    /// Tail slice of `history` that fits the window.
    pub fn apply<'a>(&self, history: &'a [ConversationMessage]) -> &'a [ConversationMessage] {
        let start = history.len().saturating_sub(self.max_messages);
        &history[start..]
    }

    /// Render the windowed history as `Role: content` lines.
    pub fn render(&self, history: &[ConversationMessage]) -> String {
        let window = self.apply(history);
        if window.is_empty() {
            return "(no previous messages)".to_string();
        }

        window
            .iter()
            .map(|m| format!("{}: {}", m.role_label(), m.content.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self { max_messages: 10 }
    }
}

/// Most recent assistant message, if any.
pub fn last_assistant_message(history: &[ConversationMessage]) -> Option<&ConversationMessage> {
    history
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
}
