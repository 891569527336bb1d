use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ConversationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

/// Ordered exchange history of one conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub entries: Vec<HistoryEntry>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.entries.push(HistoryEntry {
            role: Role::User,
            text: text.into(),
        });
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.entries.push(HistoryEntry {
            role: Role::Assistant,
            text: text.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Persistent conversation store keyed by session identifier.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load the history stored under `key`; `NotFound` when nothing was saved yet.
    async fn get(&self, key: &str) -> Result<ConversationHistory, ConversationError>;

    /// Replace the history stored under `key`.
    async fn put(&self, key: &str, history: &ConversationHistory) -> Result<(), ConversationError>;

    /// Current chat index of a session; 0 when none was recorded.
    async fn chat_index(&self, session_id: &str) -> Result<u32, ConversationError>;

    /// Start a new conversation for a session. Returns the new index.
    async fn increment_chat_index(&self, session_id: &str) -> Result<u32, ConversationError>;
}
