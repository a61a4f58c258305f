//! Arena of message nodes, partitioned by conversation

use std::collections::{BTreeMap, HashMap};

use crate::error::ChatError;
use crate::ids::{ConversationId, MessageId};
use crate::message::{Message, MessageDraft};

/// Nodes of one conversation keyed by id. Iteration is in creation order.
pub type MessageMap = BTreeMap<MessageId, Message>;

/// In-memory owner of every published message node.
///
/// Ids come from a single counter shared by all conversations and are never
/// handed out twice, including ids reserved for pending nodes that were later
/// discarded.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<ConversationId, MessageMap>,
    next_id: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id without publishing a node
    pub fn reserve_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create the conversation with its root node. Returns the existing root if
    /// the conversation is already known.
    pub fn create_conversation(&mut self, conversation_id: &ConversationId) -> MessageId {
        if let Some(root) = self.root_id(conversation_id) {
            return root;
        }
        let id = self.reserve_id();
        let root = MessageDraft::root().into_message(id, conversation_id.clone(), None);
        self.conversations
            .entry(conversation_id.clone())
            .or_default()
            .insert(id, root);
        tracing::debug!("created conversation {} with root {}", conversation_id, id);
        id
    }

    /// Seed a conversation from persisted nodes, replacing anything held for it
    pub fn insert_conversation(&mut self, conversation_id: &ConversationId, messages: Vec<Message>) {
        let map: MessageMap = messages.into_iter().map(|m| (m.id, m)).collect();
        if let Some(max) = map.keys().next_back() {
            self.next_id = self.next_id.max(max.get() + 1);
        }
        self.conversations.insert(conversation_id.clone(), map);
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    pub fn root_id(&self, conversation_id: &ConversationId) -> Option<MessageId> {
        self.conversations
            .get(conversation_id)?
            .values()
            .find(|m| m.is_root())
            .map(|m| m.id)
    }

    /// Append a new leaf under `parent_id`
    pub fn append(
        &mut self,
        conversation_id: &ConversationId,
        parent_id: MessageId,
        draft: MessageDraft,
    ) -> Result<MessageId, ChatError> {
        self.check_parent(conversation_id, parent_id)?;
        let id = self.reserve_id();
        let message = draft.into_message(id, conversation_id.clone(), Some(parent_id));
        self.link(conversation_id, message)
    }

    /// Publish a node whose id was obtained from [`reserve_id`](Self::reserve_id)
    pub fn link(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> Result<MessageId, ChatError> {
        let parent_id = message.parent.ok_or_else(|| ChatError::UnexpectedKind {
            message_id: message.id,
            expected: "child",
            actual: message.kind.as_str(),
        })?;
        self.check_parent(conversation_id, parent_id)?;

        let id = message.id;
        let map = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::InvalidParent {
                conversation_id: conversation_id.clone(),
                parent_id,
            })?;
        if let Some(parent) = map.get_mut(&parent_id) {
            parent.children.push(id);
        }
        map.insert(id, message);
        tracing::debug!("linked message {} under {} in {}", id, parent_id, conversation_id);
        Ok(id)
    }

    fn check_parent(
        &self,
        conversation_id: &ConversationId,
        parent_id: MessageId,
    ) -> Result<(), ChatError> {
        match self.conversations.get(conversation_id) {
            Some(map) if map.contains_key(&parent_id) => Ok(()),
            _ => Err(ChatError::InvalidParent {
                conversation_id: conversation_id.clone(),
                parent_id,
            }),
        }
    }

    /// All nodes of a conversation in id order. Empty for unknown conversations.
    pub fn get(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.conversations
            .get(conversation_id)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn nodes(&self, conversation_id: &ConversationId) -> Option<&MessageMap> {
        self.conversations.get(conversation_id)
    }

    pub fn message(&self, conversation_id: &ConversationId, id: MessageId) -> Option<&Message> {
        self.conversations.get(conversation_id)?.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[test]
    fn test_create_conversation_is_idempotent() {
        let mut store = MessageStore::new();
        let conv = ConversationId::new();
        let root = store.create_conversation(&conv);
        assert_eq!(store.create_conversation(&conv), root);
        assert_eq!(store.get(&conv).len(), 1);
        assert_eq!(store.get(&conv)[0].kind, MessageKind::Root);
    }

    #[test]
    fn test_append_links_children_in_order() {
        let mut store = MessageStore::new();
        let conv = ConversationId::new();
        let root = store.create_conversation(&conv);

        let a = store.append(&conv, root, MessageDraft::user("a", vec![])).unwrap();
        let b = store.append(&conv, root, MessageDraft::user("b", vec![])).unwrap();

        assert_eq!(store.message(&conv, root).unwrap().children, vec![a, b]);
        assert_eq!(store.message(&conv, b).unwrap().parent, Some(root));
    }

    #[test]
    fn test_append_rejects_unknown_parent() {
        let mut store = MessageStore::new();
        let conv = ConversationId::new();
        store.create_conversation(&conv);

        let err = store
            .append(&conv, MessageId::new(99), MessageDraft::user("x", vec![]))
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidParent { parent_id, .. } if parent_id == MessageId::new(99)));

        let other = ConversationId::new();
        assert!(store.append(&other, MessageId::new(0), MessageDraft::user("x", vec![])).is_err());
    }

    #[test]
    fn test_parent_must_belong_to_the_same_conversation() {
        let mut store = MessageStore::new();
        let first = ConversationId::new();
        let second = ConversationId::new();
        let first_root = store.create_conversation(&first);
        store.create_conversation(&second);

        assert!(store.append(&second, first_root, MessageDraft::user("x", vec![])).is_err());
    }

    #[test]
    fn test_ids_are_global_and_never_reused() {
        let mut store = MessageStore::new();
        let first = ConversationId::new();
        let second = ConversationId::new();
        let r1 = store.create_conversation(&first);
        let burned = store.reserve_id();
        let r2 = store.create_conversation(&second);

        assert!(r1 < burned && burned < r2);
    }

    #[test]
    fn test_insert_conversation_bumps_counter() {
        let mut store = MessageStore::new();
        let conv = ConversationId::from_string("loaded");
        let root = MessageDraft::root().into_message(MessageId::new(40), conv.clone(), None);
        store.insert_conversation(&conv, vec![root]);

        assert_eq!(store.root_id(&conv), Some(MessageId::new(40)));
        assert_eq!(store.reserve_id(), MessageId::new(41));
    }
}
