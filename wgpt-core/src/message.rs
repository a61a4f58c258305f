//! Message nodes of the conversation tree

use llm::{ChatMessage, ChatPayload, ContentBlock, Timings};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ids::{ConversationId, MessageId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Invisible anchor of a conversation tree
    Root,
    User,
    Assistant,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Root => "root",
            MessageKind::User => "user",
            MessageKind::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(MessageKind::Root),
            "user" => Ok(MessageKind::User),
            "assistant" => Ok(MessageKind::Assistant),
            other => Err(format!("Unknown message kind: {}", other)),
        }
    }
}

/// Attachment carried by a user message and replayed on edit/regenerate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtraItem {
    TextFile { name: String, content: String },
    /// `data:<mime>;base64,<data>` URL
    Image { name: String, data_url: String },
    /// Pasted or selected context
    Context { name: String, content: String },
    AudioFile { name: String, data: String, mime_type: String },
}

impl ExtraItem {
    fn to_content_block(&self) -> Option<ContentBlock> {
        match self {
            ExtraItem::TextFile { name, content } => Some(ContentBlock::text(format!(
                "File: {}\nContent:\n\n{}",
                name, content
            ))),
            ExtraItem::Context { content, .. } => Some(ContentBlock::text(content.clone())),
            ExtraItem::Image { name, data_url } => match split_data_url(data_url) {
                Some((mime_type, data)) => Some(ContentBlock::Image {
                    data: data.to_string(),
                    mime_type: mime_type.to_string(),
                }),
                None => {
                    tracing::warn!("dropping image attachment '{}': not a base64 data URL", name);
                    None
                }
            },
            ExtraItem::AudioFile { data, mime_type, .. } => Some(ContentBlock::Audio {
                data: data.clone(),
                mime_type: mime_type.clone(),
            }),
        }
    }
}

fn split_data_url(url: &str) -> Option<(&str, &str)> {
    url.strip_prefix("data:")?.split_once(";base64,")
}

/// A node of the conversation tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// `None` only for the root
    pub parent: Option<MessageId>,
    /// Children in creation order
    pub children: Vec<MessageId>,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub extra: Vec<ExtraItem>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timings: Option<Timings>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl Message {
    pub fn is_root(&self) -> bool {
        self.kind == MessageKind::Root
    }

    /// Convert to the transport representation. Root nodes carry nothing to send.
    pub fn to_chat_message(&self) -> Option<ChatMessage> {
        match self.kind {
            MessageKind::Root => None,
            MessageKind::Assistant => Some(ChatMessage::assistant(ChatPayload::text(&self.content))),
            MessageKind::User => {
                if self.extra.is_empty() {
                    return Some(ChatMessage::user(ChatPayload::text(&self.content)));
                }
                let mut content: Vec<ContentBlock> = self
                    .extra
                    .iter()
                    .filter_map(ExtraItem::to_content_block)
                    .collect();
                content.push(ContentBlock::text(&self.content));
                Some(ChatMessage::user(ChatPayload::new(content)))
            }
        }
    }
}

/// Content of a node before it has been given an id and a place in the tree
#[derive(Clone, Debug, PartialEq)]
pub struct MessageDraft {
    pub kind: MessageKind,
    pub content: String,
    pub reasoning: Option<String>,
    pub extra: Vec<ExtraItem>,
    pub model: Option<String>,
    pub timings: Option<Timings>,
}

impl MessageDraft {
    fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            reasoning: None,
            extra: Vec::new(),
            model: None,
            timings: None,
        }
    }

    pub fn user(content: impl Into<String>, extra: Vec<ExtraItem>) -> Self {
        Self {
            extra,
            ..Self::new(MessageKind::User, content)
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Assistant, content)
    }

    pub(crate) fn root() -> Self {
        Self::new(MessageKind::Root, "")
    }

    pub(crate) fn into_message(
        self,
        id: MessageId,
        conversation_id: ConversationId,
        parent: Option<MessageId>,
    ) -> Message {
        Message {
            id,
            conversation_id,
            parent,
            children: Vec::new(),
            kind: self.kind,
            content: self.content,
            reasoning: self.reasoning,
            extra: self.extra,
            model: self.model,
            timings: self.timings,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
