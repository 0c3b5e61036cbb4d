//! In-memory, per-conversation message history.
//!
//! Transport-agnostic: callers decide what a "turn" means. Conversations
//! are independent, so a single store-wide lock is enough; unrelated
//! sessions never contend for long.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub const DEFAULT_MAX_ENTRIES_PER_CONVERSATION: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

#[derive(Debug)]
pub struct MessageHistoryStore {
    max_entries: usize,
    conversations: RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

impl Default for MessageHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES_PER_CONVERSATION)
    }
}

impl MessageHistoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Append a trimmed entry, evicting the oldest entries beyond the cap.
    /// Empty text is ignored.
    pub async fn append(&self, conversation_id: &str, role: Role, text: &str) {
        let normalized = text.trim();
        if normalized.is_empty() {
            return;
        }

        let mut conversations = self.conversations.write().await;
        let entries = conversations
            .entry(conversation_id.to_string())
            .or_default();
        entries.push(HistoryEntry {
            role,
            text: normalized.to_string(),
        });

        if self.max_entries == 0 {
            entries.clear();
        } else if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
    }

    /// Copy of the stored history, oldest first.
    pub async fn entries(&self, conversation_id: &str) -> Vec<HistoryEntry> {
        let conversations = self.conversations.read().await;
        conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn clear(&self, conversation_id: &str) {
        self.conversations.write().await.remove(conversation_id);
    }
}
