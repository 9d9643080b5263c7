//! Saved conversations.
//!
//! Conversations live in two append-only tables: `ai_chat_history` with one
//! row per save and `ai_chat_messages` with one row per saved message,
//! ordered by an ascending row id. Saving a conversation again adds a new
//! snapshot; loading reads the latest one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{ChatMessage, Role};
use crate::error::{Error, Result};

pub const HISTORY_TABLE: &str = "ai_chat_history";
pub const MESSAGES_TABLE: &str = "ai_chat_messages";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub title: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub chat_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub trait ChatStore: Send {
    /// Appends a snapshot of conversation `uuid`. A missing title or
    /// metadata is carried over from the previous snapshot.
    fn save(
        &mut self,
        uuid: Uuid,
        title: Option<&str>,
        metadata: Option<&str>,
        messages: &[ChatMessage],
    ) -> Result<()>;

    /// The latest saved transcript of `uuid` in message order.
    fn load(&self, uuid: &Uuid) -> Result<Vec<ChatMessage>>;

    fn conversations(&self) -> Vec<ChatRecord>;

    fn messages(&self) -> Vec<MessageRecord>;
}

#[derive(Debug, Default)]
pub struct MemoryChatStore {
    chats: Vec<ChatRecord>,
    messages: Vec<MessageRecord>,
    next_chat_id: i64,
    next_message_id: i64,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest(&self, uuid: &Uuid) -> Option<&ChatRecord> {
        self.chats
            .iter()
            .filter(|c| &c.uuid == uuid)
            .max_by_key(|c| c.id)
    }
}

impl ChatStore for MemoryChatStore {
    fn save(
        &mut self,
        uuid: Uuid,
        title: Option<&str>,
        metadata: Option<&str>,
        messages: &[ChatMessage],
    ) -> Result<()> {
        let now = Utc::now();
        let previous = self.latest(&uuid);
        let title = title
            .map(str::to_string)
            .or_else(|| previous.and_then(|c| c.title.clone()));
        let metadata = metadata
            .map(str::to_string)
            .or_else(|| previous.and_then(|c| c.metadata.clone()));

        self.chats
            .try_reserve(1)
            .map_err(|_| Error::NoMem("failed to store chat".to_string()))?;
        self.messages
            .try_reserve(messages.len())
            .map_err(|_| Error::NoMem("failed to store chat messages".to_string()))?;
        self.next_chat_id += 1;
        let chat_id = self.next_chat_id;
        self.chats.push(ChatRecord {
            id: chat_id,
            uuid,
            title,
            metadata,
            created_at: now,
        });

        for message in messages {
            self.next_message_id += 1;
            self.messages.push(MessageRecord {
                id: self.next_message_id,
                chat_id,
                role: message.role,
                content: message.content.clone(),
                created_at: now,
            });
        }
        Ok(())
    }

    fn load(&self, uuid: &Uuid) -> Result<Vec<ChatMessage>> {
        let chat = self
            .latest(uuid)
            .ok_or_else(|| Error::Store(format!("no saved chat with uuid {}", uuid)))?;

        let mut rows: Vec<&MessageRecord> = self
            .messages
            .iter()
            .filter(|m| m.chat_id == chat.id)
            .collect();
        rows.sort_by_key(|m| m.id);
        Ok(rows
            .into_iter()
            .map(|m| ChatMessage::new(m.role, m.content.clone()))
            .collect())
    }

    fn conversations(&self) -> Vec<ChatRecord> {
        self.chats.clone()
    }

    fn messages(&self) -> Vec<MessageRecord> {
        self.messages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(Role::System, "be brief"),
            ChatMessage::new(Role::User, "hi"),
            ChatMessage::new(Role::Assistant, "hello"),
        ]
    }

    #[test]
    fn save_then_load_preserves_order() {
        let mut store = MemoryChatStore::new();
        let id = Uuid::now_v7();
        store.save(id, Some("greeting"), None, &transcript()).unwrap();

        assert_eq!(store.load(&id).unwrap(), transcript());
        assert_eq!(store.conversations().len(), 1);
        assert_eq!(store.conversations()[0].title.as_deref(), Some("greeting"));
    }

    #[test]
    fn resave_appends_a_snapshot() {
        let mut store = MemoryChatStore::new();
        let id = Uuid::now_v7();
        store.save(id, Some("first"), None, &transcript()[..2]).unwrap();
        let before = store.messages();
        store.save(id, None, Some("{\"k\":1}"), &transcript()).unwrap();

        let chats = store.conversations();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[1].title.as_deref(), Some("first"));
        assert_eq!(chats[1].metadata.as_deref(), Some("{\"k\":1}"));

        let messages = store.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(&messages[..2], before.as_slice());
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(store.load(&id).unwrap(), transcript());
    }

    #[test]
    fn unknown_uuid_is_an_error() {
        let store = MemoryChatStore::new();
        assert!(matches!(store.load(&Uuid::now_v7()), Err(Error::Store(_))));
    }
}
