//! Scripted chat model for controller tests

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use llm::{ChatChunk, ChatModel, ChatRequest, ChatStream, TransportError};
use std::collections::VecDeque;
use std::sync::Mutex;

pub(crate) enum Script {
    /// Emit the items, then end the stream
    Reply(Vec<Result<ChatChunk, TransportError>>),
    /// Emit the chunks, then never produce another item
    Stall(Vec<ChatChunk>),
    /// Fail before any stream is opened
    OpenError(TransportError),
}

impl Script {
    pub(crate) fn text(parts: &[&str]) -> Self {
        let mut items: Vec<_> = parts.iter().map(|p| Ok(ChatChunk::text(*p))).collect();
        items.push(Ok(ChatChunk::done(None)));
        Script::Reply(items)
    }
}

pub(crate) struct ScriptedModel {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub(crate) fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::text(&["ok"]));

        match script {
            Script::Reply(items) => Ok(Box::pin(stream::iter(items))),
            Script::Stall(chunks) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok)).chain(stream::pending()),
            )),
            Script::OpenError(e) => Err(e),
        }
    }
}
