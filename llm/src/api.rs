use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
    System,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
    Audio { data: String, mime_type: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct ChatPayload {
    pub content: Vec<ContentBlock>,
}

impl From<String> for ChatPayload {
    fn from(text: String) -> Self {
        ChatPayload::text(text)
    }
}

impl From<&str> for ChatPayload {
    fn from(text: &str) -> Self {
        ChatPayload::text(text)
    }
}

impl ChatPayload {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        ChatPayload { content }
    }

    pub fn text(text: impl Into<String>) -> Self {
        ChatPayload {
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn get_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Role,
    #[serde(flatten)]
    pub payload: ChatPayload,
}

impl ChatMessage {
    pub fn new(role: Role, payload: ChatPayload) -> Self {
        Self { role, payload }
    }

    pub fn user(payload: ChatPayload) -> Self {
        Self::new(Role::User, payload)
    }

    pub fn assistant(payload: ChatPayload) -> Self {
        Self::new(Role::Assistant, payload)
    }

    pub fn system(payload: ChatPayload) -> Self {
        Self::new(Role::System, payload)
    }

    pub fn get_text(&self) -> String {
        self.payload.get_text()
    }
}

/// Server-side timing figures reported with the final chunk (llama-server `timings`)
#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct Timings {
    #[serde(default)]
    pub prompt_n: u64,
    #[serde(default)]
    pub prompt_ms: f64,
    #[serde(default)]
    pub predicted_n: u64,
    #[serde(default)]
    pub predicted_ms: f64,
}

impl Timings {
    pub fn tokens_per_second(&self) -> Option<f64> {
        if self.predicted_ms > 0.0 {
            Some(self.predicted_n as f64 / self.predicted_ms * 1000.0)
        } else {
            None
        }
    }
}

/// Metadata carried by a chunk. Later metadata replaces earlier metadata.
#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct ChunkMetadata {
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub timings: Option<Timings>,
}

/// One increment of a streamed completion
#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct ChatChunk {
    /// Text to append to the message content
    pub delta: String,
    /// Text to append to the reasoning ("thinking") content
    pub reasoning_delta: Option<String>,
    /// The server signalled the end of the completion
    pub done: bool,
    pub metadata: Option<ChunkMetadata>,
}

impl ChatChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        ChatChunk {
            delta: delta.into(),
            ..Default::default()
        }
    }

    pub fn reasoning(delta: impl Into<String>) -> Self {
        ChatChunk {
            reasoning_delta: Some(delta.into()),
            ..Default::default()
        }
    }

    pub fn done(metadata: Option<ChunkMetadata>) -> Self {
        ChatChunk {
            done: true,
            metadata,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.delta.is_empty()
            && self.reasoning_delta.as_deref().is_none_or(str::is_empty)
            && self.metadata.is_none()
            && !self.done
    }
}

/// Request options. The sampling map is forwarded to the server untouched.
#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct GenerationOptions {
    pub model: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl GenerationOptions {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            params: serde_json::Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct ChatRequest {
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) options: GenerationOptions,
}

impl ChatRequest {
    /// Create a new chat request from an iterator of message references
    pub fn new<'a>(messages: impl IntoIterator<Item = &'a ChatMessage>) -> Self {
        ChatRequest {
            messages: messages.into_iter().cloned().collect(),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_options<'a>(
        messages: impl IntoIterator<Item = &'a ChatMessage>,
        options: GenerationOptions,
    ) -> Self {
        ChatRequest {
            messages: messages.into_iter().cloned().collect(),
            options,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_payload_text() {
        let payload = ChatPayload::text("Hello, world!");
        assert_eq!(payload.get_text(), "Hello, world!");
        assert_eq!(payload.content.len(), 1);
        assert!(matches!(payload.content[0], ContentBlock::Text { .. }));
    }

    #[test]
    fn test_chat_payload_mixed_content() {
        let payload = ChatPayload::new(vec![
            ContentBlock::text("First "),
            ContentBlock::Image {
                data: "aGVsbG8=".to_string(),
                mime_type: "image/png".to_string(),
            },
            ContentBlock::text("Second"),
        ]);

        assert_eq!(payload.get_text(), "First Second");
        assert_eq!(payload.content.len(), 3);
    }

    #[test]
    fn test_chat_message_constructors() {
        let payload = ChatPayload::text("Test");

        assert_eq!(ChatMessage::user(payload.clone()).role, Role::User);
        assert_eq!(ChatMessage::assistant(payload.clone()).role, Role::Assistant);
        assert_eq!(ChatMessage::system(payload).role, Role::System);
    }

    #[test]
    fn test_content_block_serialization() {
        let json = serde_json::to_string(&ContentBlock::text("Hello")).unwrap();
        assert!(json.contains("\"type\":\"text\""));
        assert!(json.contains("\"text\":\"Hello\""));
    }

    #[test]
    fn test_chunk_is_empty() {
        assert!(ChatChunk::default().is_empty());
        assert!(ChatChunk::reasoning("").is_empty());
        assert!(!ChatChunk::text("a").is_empty());
        assert!(!ChatChunk::done(None).is_empty());
    }

    #[test]
    fn test_tokens_per_second() {
        let timings = Timings {
            predicted_n: 50,
            predicted_ms: 500.0,
            ..Default::default()
        };
        assert_eq!(timings.tokens_per_second(), Some(100.0));
        assert_eq!(Timings::default().tokens_per_second(), None);
    }

    #[test]
    fn test_request_carries_options() {
        let messages = vec![ChatMessage::user(ChatPayload::text("Hello"))];
        let options = GenerationOptions::with_model("llama").param("temperature", 0.2);
        let request = ChatRequest::with_options(&messages, options);

        assert_eq!(request.messages().len(), 1);
        assert_eq!(request.options().model.as_deref(), Some("llama"));
        assert_eq!(request.options().params["temperature"], serde_json::json!(0.2));
    }
}
