use async_trait::async_trait;
use dashmap::DashMap;

use quill_core::conversation::{ConversationHistory, ConversationStore};
use quill_core::errors::ConversationError;

/// Process-local store. Used by tests and the `mock` provider setup.
#[derive(Default)]
pub struct MemoryConversationStore {
    histories: DashMap<String, ConversationHistory>,
    indices: DashMap<String, u32>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get(&self, key: &str) -> Result<ConversationHistory, ConversationError> {
        self.histories
            .get(key)
            .map(|h| h.clone())
            .ok_or_else(|| ConversationError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, history: &ConversationHistory) -> Result<(), ConversationError> {
        self.histories.insert(key.to_string(), history.clone());
        Ok(())
    }

    async fn chat_index(&self, session_id: &str) -> Result<u32, ConversationError> {
        Ok(self.indices.get(session_id).map(|i| *i).unwrap_or(0))
    }

    async fn increment_chat_index(&self, session_id: &str) -> Result<u32, ConversationError> {
        let mut index = self.indices.entry(session_id.to_string()).or_insert(0);
        *index += 1;
        Ok(*index)
    }
}
