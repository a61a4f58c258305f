//! Streaming assembler for in-flight assistant responses
//!
//! The assembler owns the pending node while a response streams in. The node
//! has a reserved id but is not listed by its parent until it is committed,
//! so the published tree never contains half-built messages.
//!
//! ```text
//! Idle -> Streaming -> Committed
//!                   -> Cancelled  (partial content kept)
//!                   -> Failed     (pending node discarded)
//! ```

use llm::{ChatChunk, ChunkMetadata};

use crate::error::{ChatError, GenerationError};
use crate::ids::{ConversationId, MessageId};
use crate::message::{Message, MessageDraft};
use crate::store::MessageStore;

#[derive(Clone, Debug, PartialEq)]
pub enum AssemblerState {
    Idle,
    Streaming,
    Committed,
    Cancelled,
    Failed(GenerationError),
}

impl AssemblerState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, AssemblerState::Idle | AssemblerState::Streaming)
    }
}

/// The not-yet-published assistant message
#[derive(Clone, Debug, PartialEq)]
pub struct PendingMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub parent: MessageId,
    pub content: String,
    pub reasoning: Option<String>,
    /// Model the request was sent to; replaced by the model reported in metadata
    pub model: Option<String>,
    pub metadata: Option<ChunkMetadata>,
}

impl PendingMessage {
    pub fn has_content(&self) -> bool {
        !self.content.is_empty() || self.reasoning.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// Render the pending node as a message for display
    pub fn snapshot(&self) -> Message {
        let mut draft = MessageDraft::assistant(self.content.clone());
        draft.reasoning = self.reasoning.clone();
        draft.model = self
            .metadata
            .as_ref()
            .and_then(|m| m.model.clone())
            .or_else(|| self.model.clone());
        draft.timings = self.metadata.as_ref().and_then(|m| m.timings.clone());
        draft.into_message(self.id, self.conversation_id.clone(), Some(self.parent))
    }

    fn apply(&mut self, chunk: &ChatChunk) {
        self.content.push_str(&chunk.delta);
        if let Some(reasoning) = chunk.reasoning_delta.as_deref() {
            self.reasoning.get_or_insert_with(String::new).push_str(reasoning);
        }
        if let Some(metadata) = &chunk.metadata {
            self.metadata = Some(metadata.clone());
        }
    }
}

/// State machine folding streamed chunks into one assistant message
#[derive(Debug)]
pub struct StreamingAssembler {
    state: AssemblerState,
    pending: Option<PendingMessage>,
}

impl StreamingAssembler {
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
            pending: None,
        }
    }

    pub fn state(&self) -> &AssemblerState {
        &self.state
    }

    pub fn pending(&self) -> Option<&PendingMessage> {
        self.pending.as_ref()
    }

    /// Reserve a pending node under `parent_id` and enter `Streaming`
    pub fn start(
        &mut self,
        store: &mut MessageStore,
        conversation_id: &ConversationId,
        parent_id: MessageId,
        model: Option<String>,
    ) -> Result<MessageId, ChatError> {
        if self.state == AssemblerState::Streaming {
            return Err(ChatError::AlreadyGenerating(conversation_id.clone()));
        }
        if store.message(conversation_id, parent_id).is_none() {
            return Err(ChatError::InvalidParent {
                conversation_id: conversation_id.clone(),
                parent_id,
            });
        }

        let id = store.reserve_id();
        self.pending = Some(PendingMessage {
            id,
            conversation_id: conversation_id.clone(),
            parent: parent_id,
            content: String::new(),
            reasoning: None,
            model,
            metadata: None,
        });
        self.state = AssemblerState::Streaming;
        tracing::debug!("assembler streaming into {} under {}", id, parent_id);
        Ok(id)
    }

    /// Fold one chunk into the pending node.
    ///
    /// Returns the pending id so observers can follow the stream, or `None`
    /// when nothing is streaming.
    pub fn apply(&mut self, chunk: &ChatChunk) -> Option<MessageId> {
        if self.state != AssemblerState::Streaming {
            tracing::debug!("ignoring chunk outside of streaming state: {:?}", self.state);
            return None;
        }
        let pending = self.pending.as_mut()?;
        pending.apply(chunk);
        Some(pending.id)
    }

    /// Publish the completed response
    pub fn commit(&mut self, store: &mut MessageStore) -> Result<MessageId, ChatError> {
        self.finish(store, AssemblerState::Committed, || {
            GenerationError::InvalidResponse("response contained no content".to_string())
        })
    }

    /// Stop early, keeping whatever content already arrived
    pub fn cancel(&mut self, store: &mut MessageStore) -> Result<MessageId, ChatError> {
        self.finish(store, AssemblerState::Cancelled, || GenerationError::Aborted)
    }

    /// Discard the pending node
    pub fn fail(&mut self, reason: GenerationError) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!("discarding pending message {}: {}", pending.id, reason);
        }
        self.state = AssemblerState::Failed(reason);
    }

    fn finish(
        &mut self,
        store: &mut MessageStore,
        target: AssemblerState,
        empty_reason: impl FnOnce() -> GenerationError,
    ) -> Result<MessageId, ChatError> {
        if self.state != AssemblerState::Streaming {
            return Err(GenerationError::InvalidResponse(format!(
                "assembler is not streaming ({:?})",
                self.state
            ))
            .into());
        }
        let Some(pending) = self.pending.take() else {
            let reason = empty_reason();
            self.state = AssemblerState::Failed(reason.clone());
            return Err(reason.into());
        };
        if !pending.has_content() {
            let reason = empty_reason();
            tracing::debug!("discarding empty pending message {}: {}", pending.id, reason);
            self.state = AssemblerState::Failed(reason.clone());
            return Err(reason.into());
        }

        match store.link(&pending.conversation_id, pending.snapshot()) {
            Ok(id) => {
                tracing::debug!("assembler {:?} message {}", target, id);
                self.state = target;
                Ok(id)
            }
            Err(e) => {
                self.state = AssemblerState::Failed(GenerationError::InvalidResponse(e.to_string()));
                Err(e)
            }
        }
    }
}

impl Default for StreamingAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamingAssembler {
    fn drop(&mut self) {
        if let Some(pending) = &self.pending {
            if self.state == AssemblerState::Streaming {
                tracing::warn!(
                    "assembler dropped while streaming, pending message {} lost ({} bytes)",
                    pending.id,
                    pending.content.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::Timings;

    fn setup() -> (MessageStore, ConversationId, MessageId) {
        let mut store = MessageStore::new();
        let conv = ConversationId::new();
        let root = store.create_conversation(&conv);
        let user = store.append(&conv, root, MessageDraft::user("hi", vec![])).unwrap();
        (store, conv, user)
    }

    #[test]
    fn test_new_assembler_is_idle() {
        let assembler = StreamingAssembler::new();
        assert_eq!(assembler.state(), &AssemblerState::Idle);
        assert!(assembler.pending().is_none());
    }

    #[test]
    fn test_pending_is_not_linked_until_commit() {
        let (mut store, conv, user) = setup();
        let mut assembler = StreamingAssembler::new();
        let pending = assembler.start(&mut store, &conv, user, None).unwrap();

        assert_eq!(assembler.apply(&ChatChunk::text("Hi")), Some(pending));
        assert!(store.message(&conv, user).unwrap().children.is_empty());
        assert!(store.message(&conv, pending).is_none());

        assert_eq!(assembler.commit(&mut store).unwrap(), pending);
        assert_eq!(assembler.state(), &AssemblerState::Committed);
        assert_eq!(store.message(&conv, user).unwrap().children, vec![pending]);
        assert_eq!(store.message(&conv, pending).unwrap().content, "Hi");
    }

    #[test]
    fn test_cancel_keeps_partial_content() {
        let (mut store, conv, user) = setup();
        let mut assembler = StreamingAssembler::new();
        assembler.start(&mut store, &conv, user, None).unwrap();
        assembler.apply(&ChatChunk::text("Hel"));
        assembler.apply(&ChatChunk::text("lo"));

        let id = assembler.cancel(&mut store).unwrap();
        assert_eq!(assembler.state(), &AssemblerState::Cancelled);
        assert_eq!(store.message(&conv, id).unwrap().content, "Hello");
    }

    #[test]
    fn test_cancel_before_any_chunk_discards() {
        let (mut store, conv, user) = setup();
        let mut assembler = StreamingAssembler::new();
        assembler.start(&mut store, &conv, user, None).unwrap();

        let err = assembler.cancel(&mut store).unwrap_err();
        assert_eq!(err, ChatError::Generation(GenerationError::Aborted));
        assert_eq!(assembler.state(), &AssemblerState::Failed(GenerationError::Aborted));
        assert!(store.message(&conv, user).unwrap().children.is_empty());
    }

    #[test]
    fn test_empty_completion_is_invalid() {
        let (mut store, conv, user) = setup();
        let mut assembler = StreamingAssembler::new();
        assembler.start(&mut store, &conv, user, None).unwrap();
        assembler.apply(&ChatChunk::done(None));

        assert!(matches!(
            assembler.commit(&mut store),
            Err(ChatError::Generation(GenerationError::InvalidResponse(_)))
        ));
        assert!(store.message(&conv, user).unwrap().children.is_empty());
    }

    #[test]
    fn test_fail_discards_pending() {
        let (mut store, conv, user) = setup();
        let mut assembler = StreamingAssembler::new();
        let pending = assembler.start(&mut store, &conv, user, None).unwrap();
        assembler.apply(&ChatChunk::text("partial"));

        assembler.fail(GenerationError::NetworkError("reset".into()));
        assert!(assembler.pending().is_none());
        assert!(store.message(&conv, pending).is_none());
        assert!(assembler.state().is_finished());
        assert_eq!(assembler.apply(&ChatChunk::text("late")), None);
    }

    #[test]
    fn test_reasoning_appends_and_metadata_replaces() {
        let (mut store, conv, user) = setup();
        let mut assembler = StreamingAssembler::new();
        assembler
            .start(&mut store, &conv, user, Some("requested".into()))
            .unwrap();

        assembler.apply(&ChatChunk::reasoning("think"));
        assembler.apply(&ChatChunk::reasoning("ing"));
        assembler.apply(&ChatChunk {
            delta: "answer".into(),
            metadata: Some(ChunkMetadata {
                model: Some("first".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assembler.apply(&ChatChunk::done(Some(ChunkMetadata {
            model: Some("qwen".into()),
            finish_reason: Some("stop".into()),
            timings: Some(Timings {
                predicted_n: 10,
                predicted_ms: 500.0,
                ..Default::default()
            }),
        })));

        let id = assembler.commit(&mut store).unwrap();
        let message = store.message(&conv, id).unwrap();
        assert_eq!(message.reasoning.as_deref(), Some("thinking"));
        assert_eq!(message.model.as_deref(), Some("qwen"));
        assert_eq!(message.timings.as_ref().unwrap().predicted_n, 10);
    }

    #[test]
    fn test_start_rejects_unknown_parent_and_double_start() {
        let (mut store, conv, user) = setup();
        let mut assembler = StreamingAssembler::new();
        assert!(matches!(
            assembler.start(&mut store, &conv, MessageId::new(500), None),
            Err(ChatError::InvalidParent { .. })
        ));
        assert_eq!(assembler.state(), &AssemblerState::Idle);

        assembler.start(&mut store, &conv, user, None).unwrap();
        assert!(matches!(
            assembler.start(&mut store, &conv, user, None),
            Err(ChatError::AlreadyGenerating(_))
        ));
        assembler.fail(GenerationError::Aborted);
    }
}
