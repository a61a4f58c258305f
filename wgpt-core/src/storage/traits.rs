use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::ids::ConversationId;
use crate::message::{Message, MessageKind};

/// Information about a conversation for listing/display
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationInfo {
    pub id: ConversationId,
    /// First user message, used as a title
    pub name: Option<String>,
    /// Visible (non-root) messages across all branches
    pub message_count: usize,
    /// Unix timestamp in milliseconds of the newest message
    pub last_modified: i64,
}

impl ConversationInfo {
    pub fn from_messages(id: ConversationId, messages: &[Message]) -> Self {
        let name = messages
            .iter()
            .find(|m| m.kind == MessageKind::User)
            .map(|m| Self::title(&m.content));
        Self {
            id,
            name,
            message_count: messages.iter().filter(|m| !m.is_root()).count(),
            last_modified: messages.iter().map(|m| m.timestamp).max().unwrap_or_default(),
        }
    }

    /// First line of a message, shortened for conversation lists
    pub(crate) fn title(content: &str) -> String {
        const MAX_CHARS: usize = 48;
        let line = content.lines().next().unwrap_or_default().trim();
        if line.chars().count() > MAX_CHARS {
            let cut: String = line.chars().take(MAX_CHARS).collect();
            format!("{}…", cut.trim_end())
        } else {
            line.to_string()
        }
    }
}

/// Durable storage for whole conversation trees, addressed by conversation id
#[async_trait]
pub trait ConversationStorage: Send + Sync {
    /// Load every node of a conversation. Unknown conversations load as empty.
    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;

    /// Replace the stored nodes of a conversation
    async fn save(&self, conversation_id: &ConversationId, messages: &[Message]) -> Result<()>;

    /// Stored conversations, most recently modified first
    async fn list(&self) -> Result<Vec<ConversationInfo>>;
}

#[async_trait]
impl<T: ConversationStorage + ?Sized> ConversationStorage for Arc<T> {
    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        (**self).load(conversation_id).await
    }

    async fn save(&self, conversation_id: &ConversationId, messages: &[Message]) -> Result<()> {
        (**self).save(conversation_id, messages).await
    }

    async fn list(&self) -> Result<Vec<ConversationInfo>> {
        (**self).list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_is_first_line_truncated() {
        assert_eq!(ConversationInfo::title("hello\nworld"), "hello");
        let long = "x".repeat(60);
        let title = ConversationInfo::title(&long);
        assert_eq!(title.chars().count(), 49);
        assert!(title.ends_with('…'));
    }
}
