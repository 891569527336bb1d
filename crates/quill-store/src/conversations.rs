use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use quill_core::conversation::{ConversationHistory, ConversationStore};
use quill_core::errors::ConversationError;

use crate::database::Database;
use crate::error::StoreError;

/// Conversation histories and chat indices in SQLite.
#[derive(Clone)]
pub struct SqliteConversationStore {
    db: Database,
}

impl SqliteConversationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn load(&self, key: &str) -> Result<ConversationHistory, StoreError> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT history_json FROM conversations WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    #[instrument(skip(self, history), fields(entries = history.len()))]
    pub fn save(&self, key: &str, history: &ConversationHistory) -> Result<(), StoreError> {
        let json = serde_json::to_string(history)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (key, history_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET history_json = excluded.history_json,
                                                updated_at = excluded.updated_at",
                rusqlite::params![key, json, now],
            )?;
            Ok(())
        })
    }

    pub fn current_index(&self, session_id: &str) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let index: Option<u32> = conn
                .query_row(
                    "SELECT chat_index FROM chat_index WHERE session_id = ?1",
                    [session_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(index.unwrap_or(0))
        })
    }

    #[instrument(skip(self))]
    pub fn next_index(&self, session_id: &str) -> Result<u32, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "INSERT INTO chat_index (session_id, chat_index, updated_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET chat_index = chat_index + 1,
                                                       updated_at = excluded.updated_at
                 RETURNING chat_index",
                rusqlite::params![session_id, now],
                |row| row.get(0),
            )?)
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get(&self, key: &str) -> Result<ConversationHistory, ConversationError> {
        Ok(self.load(key)?)
    }

    async fn put(&self, key: &str, history: &ConversationHistory) -> Result<(), ConversationError> {
        Ok(self.save(key, history)?)
    }

    async fn chat_index(&self, session_id: &str) -> Result<u32, ConversationError> {
        Ok(self.current_index(session_id)?)
    }

    async fn increment_chat_index(&self, session_id: &str) -> Result<u32, ConversationError> {
        Ok(self.next_index(session_id)?)
    }
}
