use crate::api::{ChatChunk, ChatRequest};
use crate::client::Client;
use crate::error::TransportError;
use crate::ChatModel;
use crate::ChatStream;
use async_trait::async_trait;
use futures::StreamExt;

use super::api::{ChatCompletionChunk, ChatCompletionRequest};

/// Chat model served by llama-server (or any OpenAI-compatible endpoint)
#[derive(Clone)]
pub struct LlamaChatModel {
    client: Client,
    base_url: String,
    model_name: String,
}

impl LlamaChatModel {
    pub fn new(client: Client, base_url: String, model_name: String) -> Self {
        LlamaChatModel {
            client,
            base_url,
            model_name,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

/// Accepts `data: {...}` SSE lines; comments, blank lines and `[DONE]` are skipped.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let json_str = line.trim().strip_prefix("data:")?.trim_start();
    if json_str == "[DONE]" {
        return None;
    }
    Some(json_str)
}

#[async_trait]
impl ChatModel for LlamaChatModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, TransportError> {
        let body = ChatCompletionRequest::from_request(Some(self.model_name.clone()), request);

        let stream = self
            .client
            .post_stream::<_, _, _, ChatCompletionChunk>(self.chat_url(), &body, sse_data)
            .await?;

        Ok(Box::pin(stream.map(|chunk| chunk.map(ChatChunk::from))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::decode_lines;
    use bytes::Bytes;
    use futures::stream;

    #[test]
    fn test_sse_data_filters_lines() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:{\"a\":1}\r"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data: [DONE]"), None);
        assert_eq!(sse_data(": ping"), None);
        assert_eq!(sse_data(""), None);
    }

    #[tokio::test]
    async fn test_sse_body_decodes_into_chunks() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let bytes = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);

        let chunks: Vec<ChatChunk> = decode_lines::<_, _, _, ChatCompletionChunk>(bytes, sse_data)
            .map(|c| ChatChunk::from(c.unwrap()))
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        let text: String = chunks.iter().map(|c| c.delta.as_str()).collect();
        assert_eq!(text, "Hello");
        assert!(chunks[2].done);
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_reads() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo 🦀\"}}]}\n".as_bytes();
        let crab = line.windows(4).position(|w| w == "🦀".as_bytes()).unwrap();
        let (head, tail) = line.split_at(crab + 2);
        let bytes = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::copy_from_slice(head)),
            Ok(Bytes::copy_from_slice(tail)),
        ]);

        let chunks: Vec<ChatChunk> = decode_lines::<_, _, _, ChatCompletionChunk>(bytes, sse_data)
            .map(|c| ChatChunk::from(c.unwrap()))
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delta, "héllo 🦀");
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_protocol_error() {
        let mut body = b"data: {\"choices\":[{\"delta\":{\"content\":\"".to_vec();
        body.extend_from_slice(&[0xff, 0xfe]);
        body.extend_from_slice(b"\"}}]}\n");
        let bytes = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);

        let results: Vec<_> = decode_lines::<_, _, _, ChatCompletionChunk>(bytes, sse_data)
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(TransportError::Protocol(_))));
    }
}
