//! In-memory conversation storage
//!
//! This is the default storage backend - fast but not persistent.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::traits::{ConversationInfo, ConversationStorage};
use crate::ids::ConversationId;
use crate::message::Message;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    conversations: Mutex<HashMap<ConversationId, Vec<Message>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationId, Vec<Message>>> {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ConversationStorage for MemoryStorage {
    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        Ok(self.lock().get(conversation_id).cloned().unwrap_or_default())
    }

    async fn save(&self, conversation_id: &ConversationId, messages: &[Message]) -> Result<()> {
        self.lock()
            .insert(conversation_id.clone(), messages.to_vec());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationInfo>> {
        let mut infos: Vec<ConversationInfo> = self
            .lock()
            .iter()
            .map(|(id, messages)| ConversationInfo::from_messages(id.clone(), messages))
            .collect();
        infos.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageDraft;
    use crate::store::MessageStore;

    #[tokio::test]
    async fn test_save_load_and_list() {
        let storage = MemoryStorage::new();
        let conv = ConversationId::new();
        assert!(storage.load(&conv).await.unwrap().is_empty());

        let mut store = MessageStore::new();
        let root = store.create_conversation(&conv);
        store
            .append(&conv, root, MessageDraft::user("What is Rust?", vec![]))
            .unwrap();
        storage.save(&conv, &store.get(&conv)).await.unwrap();

        assert_eq!(storage.load(&conv).await.unwrap(), store.get(&conv));
        let infos = storage.list().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name.as_deref(), Some("What is Rust?"));
        assert_eq!(infos[0].message_count, 1);
    }
}
