use crate::api::{ChatChunk, ChatMessage, ChatRequest, ChunkMetadata, ContentBlock, Role, Timings};
use serde::{Deserialize, Serialize};

/// OpenAI-style content part for multimodal messages
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlContent },
    InputAudio { input_audio: InputAudioContent },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub(crate) struct ImageUrlContent {
    pub(crate) url: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub(crate) struct InputAudioContent {
    pub(crate) data: String,
    pub(crate) format: String,
}

/// Message content - a plain string or an array of parts
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub(crate) enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Message {
    pub(crate) role: Role,
    pub(crate) content: MessageContent,
}

impl From<&ChatMessage> for Message {
    fn from(msg: &ChatMessage) -> Self {
        let parts: Vec<ContentPart> = msg
            .payload
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => ContentPart::Text { text: text.clone() },
                ContentBlock::Image { data, mime_type } => ContentPart::ImageUrl {
                    image_url: ImageUrlContent {
                        url: format!("data:{};base64,{}", mime_type, data),
                    },
                },
                ContentBlock::Audio { data, mime_type } => ContentPart::InputAudio {
                    input_audio: InputAudioContent {
                        data: data.clone(),
                        // "audio/wav" -> "wav"
                        format: mime_type.strip_prefix("audio/").unwrap_or("wav").to_string(),
                    },
                },
            })
            .collect();

        let content = match parts.as_slice() {
            [] => MessageContent::Text(String::new()),
            [ContentPart::Text { text }] => MessageContent::Text(text.clone()),
            _ => MessageContent::Parts(parts),
        };

        Message {
            role: msg.role,
            content,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct ChatCompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) model: Option<String>,
    pub(crate) messages: Vec<Message>,
    pub(crate) stream: bool,
    /// Sampling parameters, forwarded as top-level request fields
    #[serde(flatten)]
    pub(crate) params: serde_json::Map<String, serde_json::Value>,
}

impl ChatCompletionRequest {
    pub(crate) fn from_request(model: Option<String>, request: &ChatRequest) -> Self {
        ChatCompletionRequest {
            model: request.options.model.clone().or(model),
            messages: request.messages.iter().map(|m| m.into()).collect(),
            stream: true,
            params: request.options.params.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub(crate) struct ChatCompletionChunkDelta {
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default)]
    pub(crate) reasoning_content: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ChatCompletionChunkChoice {
    #[serde(default)]
    pub(crate) delta: ChatCompletionChunkDelta,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ChatCompletionChunk {
    #[serde(default)]
    pub(crate) model: Option<String>,
    #[serde(default)]
    pub(crate) choices: Vec<ChatCompletionChunkChoice>,
    #[serde(default)]
    pub(crate) timings: Option<Timings>,
}

impl From<ChatCompletionChunk> for ChatChunk {
    fn from(chunk: ChatCompletionChunk) -> Self {
        let (delta, finish_reason) = match chunk.choices.into_iter().next() {
            Some(choice) => (choice.delta, choice.finish_reason),
            None => (ChatCompletionChunkDelta::default(), None),
        };

        let done = finish_reason.is_some();
        let metadata = if done || chunk.timings.is_some() {
            Some(ChunkMetadata {
                model: chunk.model,
                finish_reason,
                timings: chunk.timings,
            })
        } else {
            None
        };

        ChatChunk {
            delta: delta.content.unwrap_or_default(),
            reasoning_delta: delta.reasoning_content.filter(|r| !r.is_empty()),
            done,
            metadata,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Model {
    pub(crate) id: String,
}

/// `GET /v1/models`
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ListModelsResponse {
    pub(crate) data: Vec<Model>,
}

/// `GET /props` as written by the model registry
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct PropsResponse {
    #[serde(default)]
    pub(crate) models: Option<Vec<crate::ModelDefinition>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatPayload, GenerationOptions};

    #[test]
    fn test_single_text_block_serializes_as_string() {
        let msg = ChatMessage::user(ChatPayload::text("Hi"));
        let json = serde_json::to_value(Message::from(&msg)).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "Hi"}));
    }

    #[test]
    fn test_attachments_become_parts() {
        let msg = ChatMessage::user(ChatPayload::new(vec![
            ContentBlock::Image {
                data: "AAAA".to_string(),
                mime_type: "image/png".to_string(),
            },
            ContentBlock::text("What is this?"),
        ]));
        let json = serde_json::to_value(Message::from(&msg)).unwrap();

        assert_eq!(json["content"][0]["type"], "image_url");
        assert_eq!(json["content"][0]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(json["content"][1]["text"], "What is this?");
    }

    #[test]
    fn test_request_flattens_sampling_params() {
        let messages = vec![ChatMessage::user(ChatPayload::text("Hi"))];
        let options = GenerationOptions::default()
            .param("temperature", 0.8)
            .param("top_k", 40);
        let request = ChatRequest::with_options(&messages, options);

        let body = ChatCompletionRequest::from_request(Some("llama".to_string()), &request);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["model"], "llama");
        assert_eq!(json["stream"], true);
        assert_eq!(json["temperature"], 0.8);
        assert_eq!(json["top_k"], 40);
    }

    #[test]
    fn test_content_delta_chunk() {
        let raw = r#"{"choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}],"model":"llama"}"#;
        let chunk: ChatChunk = serde_json::from_str::<ChatCompletionChunk>(raw).unwrap().into();

        assert_eq!(chunk.delta, "Hel");
        assert!(!chunk.done);
        assert!(chunk.metadata.is_none());
    }

    #[test]
    fn test_final_chunk_carries_metadata() {
        let raw = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"model":"llama",
            "timings":{"prompt_n":5,"prompt_ms":12.5,"predicted_n":20,"predicted_ms":400.0}}"#;
        let chunk: ChatChunk = serde_json::from_str::<ChatCompletionChunk>(raw).unwrap().into();

        assert!(chunk.done);
        assert_eq!(chunk.delta, "");
        let metadata = chunk.metadata.unwrap();
        assert_eq!(metadata.finish_reason.as_deref(), Some("stop"));
        assert_eq!(metadata.model.as_deref(), Some("llama"));
        assert_eq!(metadata.timings.unwrap().predicted_n, 20);
    }

    #[test]
    fn test_reasoning_delta() {
        let raw = r#"{"choices":[{"delta":{"reasoning_content":"thinking"}}]}"#;
        let chunk: ChatChunk = serde_json::from_str::<ChatCompletionChunk>(raw).unwrap().into();

        assert_eq!(chunk.reasoning_delta.as_deref(), Some("thinking"));
        assert_eq!(chunk.delta, "");
    }
}
