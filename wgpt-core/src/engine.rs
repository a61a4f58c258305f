use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use llm::{ChatMessage, ChatModel, ChatPayload, ChatRequest, GenerationOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::assembler::{PendingMessage, StreamingAssembler};
use crate::error::{ChatError, GenerationError};
use crate::ids::{ConversationId, MessageId};
use crate::message::{ExtraItem, Message, MessageDraft, MessageKind};
use crate::storage::{ConversationInfo, ConversationStorage};
use crate::store::MessageStore;
use crate::tree::{self, MessageDisplay};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The in-flight response changed. Carries a snapshot of the pending message.
    PendingUpdated {
        conversation_id: ConversationId,
        message: Message,
    },
    /// The response was published; `cancelled` is set when it was stopped early
    Committed {
        conversation_id: ConversationId,
        message_id: MessageId,
        cancelled: bool,
    },
    Failed {
        conversation_id: ConversationId,
        reason: GenerationError,
    },
    Error(String),
}

/// User input for a new or edited message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub content: String,
    pub extra: Vec<ExtraItem>,
}

impl Prompt {
    pub fn new(content: impl Into<String>, extra: Vec<ExtraItem>) -> Self {
        Self {
            content: content.into(),
            extra,
        }
    }
}

impl From<&str> for Prompt {
    fn from(content: &str) -> Self {
        Self::new(content, Vec::new())
    }
}

impl From<String> for Prompt {
    fn from(content: String) -> Self {
        Self::new(content, Vec::new())
    }
}

/// Ids created when a generation starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedGeneration {
    /// User message appended for a send or an edit
    pub user_message: Option<MessageId>,
    /// Reserved id of the response; published under this id on commit
    pub pending: MessageId,
}

/// What the renderer paints for one conversation
#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    pub messages: Vec<MessageDisplay>,
    /// In-flight response, present while the viewer follows the stream
    pub pending: Option<Message>,
}

struct ActiveGeneration {
    pending: Option<Message>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    store: MessageStore,
    active: HashMap<ConversationId, ActiveGeneration>,
    /// Leaf followed by the viewer; absent means the natural leaf
    current_leaf: HashMap<ConversationId, MessageId>,
}

impl State {
    fn current_leaf(&self, conversation_id: &ConversationId) -> Option<MessageId> {
        match self.current_leaf.get(conversation_id) {
            Some(id) => Some(*id),
            None => self.store.nodes(conversation_id).and_then(tree::natural_leaf),
        }
    }

    fn lookup(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        expected: MessageKind,
    ) -> Result<&Message, ChatError> {
        let message = self
            .store
            .message(conversation_id, message_id)
            .ok_or_else(|| ChatError::UnknownMessage {
                conversation_id: conversation_id.clone(),
                message_id,
            })?;
        if message.kind != expected {
            return Err(ChatError::UnexpectedKind {
                message_id,
                expected: expected.as_str(),
                actual: message.kind.as_str(),
            });
        }
        Ok(message)
    }
}

struct Shared<S> {
    state: Mutex<State>,
    storage: S,
}

impl<S> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_pending(&self, conversation_id: &ConversationId, snapshot: Message) {
        if let Some(active) = self.lock().active.get_mut(conversation_id) {
            active.pending = Some(snapshot);
        }
    }

    fn finish_active(&self, conversation_id: &ConversationId) {
        self.lock().active.remove(conversation_id);
    }
}

enum Plan {
    Send {
        parent: Option<MessageId>,
        prompt: Prompt,
    },
    Edit {
        message_id: MessageId,
        content: String,
        extra: Option<Vec<ExtraItem>>,
    },
    Regenerate {
        message_id: MessageId,
    },
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(GenerationError),
}

/// Drives generations against a chat model and owns the conversation trees.
///
/// At most one response streams per conversation. Each generation runs on its
/// own task and reports progress through [`EngineEvent`]s.
pub struct GenerationController<S: ConversationStorage + 'static> {
    shared: Arc<Shared<S>>,
    model: Arc<dyn ChatModel + Send + Sync>,
    options: GenerationOptions,
    system_message: Option<String>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    event_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl<S: ConversationStorage + 'static> GenerationController<S> {
    pub fn new(storage: S, model: Arc<dyn ChatModel + Send + Sync>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                storage,
            }),
            model,
            options: GenerationOptions::default(),
            system_message: None,
            event_tx,
            event_rx,
        }
    }

    pub fn with_system_message(mut self, system_message: Option<String>) -> Self {
        self.system_message = system_message.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn set_model(&mut self, model: Arc<dyn ChatModel + Send + Sync>) {
        tracing::info!("switching model to {}", model.name());
        self.model = model;
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn storage(&self) -> &S {
        &self.shared.storage
    }

    /// Start an empty conversation. Nothing is persisted until the first message.
    pub fn new_conversation(&self) -> ConversationId {
        let id = ConversationId::new();
        self.shared.lock().store.create_conversation(&id);
        id
    }

    /// Load a conversation from storage and reset the viewer to its newest branch
    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> anyhow::Result<()> {
        let known = self.shared.lock().store.contains(conversation_id);
        let loaded = if known {
            None
        } else {
            Some(self.shared.storage.load(conversation_id).await?)
        };

        let mut state = self.shared.lock();
        if let Some(messages) = loaded {
            if state.store.contains(conversation_id) {
                tracing::debug!("conversation {} appeared while loading", conversation_id);
            } else if messages.is_empty() {
                state.store.create_conversation(conversation_id);
            } else {
                tracing::debug!("loaded {} messages for {}", messages.len(), conversation_id);
                state.store.insert_conversation(conversation_id, messages);
                if let Some(Err(e)) = state.store.nodes(conversation_id).map(tree::check_integrity) {
                    tracing::warn!("conversation {} is damaged: {}", conversation_id, e);
                }
            }
        }
        state.current_leaf.remove(conversation_id);
        Ok(())
    }

    pub async fn list_conversations(&self) -> anyhow::Result<Vec<ConversationInfo>> {
        self.shared.storage.list().await
    }

    pub fn is_generating(&self, conversation_id: &ConversationId) -> bool {
        self.shared.lock().active.contains_key(conversation_id)
    }

    /// Ask the active generation to stop. Content received so far is kept.
    pub fn stop(&self, conversation_id: &ConversationId) -> bool {
        match self.shared.lock().active.get(conversation_id) {
            Some(active) => {
                tracing::debug!("stopping generation in {}", conversation_id);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Append a user message under `parent` (the current leaf when `None`) and
    /// generate a reply to it
    pub fn send(
        &self,
        conversation_id: &ConversationId,
        parent: Option<MessageId>,
        prompt: impl Into<Prompt>,
    ) -> Result<StartedGeneration, ChatError> {
        self.launch(
            conversation_id,
            Plan::Send {
                parent,
                prompt: prompt.into(),
            },
        )
    }

    /// Add the edited text as a new sibling of a user message and generate a
    /// reply to it. `extra: None` keeps the original attachments.
    pub fn edit(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        content: impl Into<String>,
        extra: Option<Vec<ExtraItem>>,
    ) -> Result<StartedGeneration, ChatError> {
        self.launch(
            conversation_id,
            Plan::Edit {
                message_id,
                content: content.into(),
                extra,
            },
        )
    }

    /// Generate a new sibling of an assistant message
    pub fn regenerate(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
    ) -> Result<StartedGeneration, ChatError> {
        self.launch(conversation_id, Plan::Regenerate { message_id })
    }

    /// Follow `leaf`, or the newest branch when `None`
    pub fn select_leaf(
        &self,
        conversation_id: &ConversationId,
        leaf: Option<MessageId>,
    ) -> Result<(), ChatError> {
        let mut state = self.shared.lock();
        match leaf {
            None => {
                state.current_leaf.remove(conversation_id);
            }
            Some(id) => {
                if state.store.message(conversation_id, id).is_none() {
                    return Err(ChatError::UnknownMessage {
                        conversation_id: conversation_id.clone(),
                        message_id: id,
                    });
                }
                state.current_leaf.insert(conversation_id.clone(), id);
            }
        }
        Ok(())
    }

    pub fn current_leaf(&self, conversation_id: &ConversationId) -> Option<MessageId> {
        self.shared.lock().current_leaf(conversation_id)
    }

    pub fn display(&self, conversation_id: &ConversationId) -> ConversationView {
        let state = self.shared.lock();
        let Some(nodes) = state.store.nodes(conversation_id) else {
            return ConversationView::default();
        };

        let leaf = state.current_leaf(conversation_id);
        let pending = state
            .active
            .get(conversation_id)
            .and_then(|a| a.pending.as_ref())
            .filter(|p| Some(p.id) == leaf);

        match pending {
            Some(pending) => ConversationView {
                messages: tree::resolve_path(nodes, pending.parent),
                pending: Some(pending.clone()),
            },
            None => ConversationView {
                messages: tree::resolve_path(nodes, leaf),
                pending: None,
            },
        }
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.shared.lock().store.get(conversation_id)
    }

    pub fn message(&self, conversation_id: &ConversationId, id: MessageId) -> Option<Message> {
        self.shared.lock().store.message(conversation_id, id).cloned()
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }

    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.event_rx.recv().await
    }

    fn launch(
        &self,
        conversation_id: &ConversationId,
        plan: Plan,
    ) -> Result<StartedGeneration, ChatError> {
        let mut state = self.shared.lock();
        if state.active.contains_key(conversation_id) {
            tracing::warn!("rejecting generation in {}: already generating", conversation_id);
            return Err(ChatError::AlreadyGenerating(conversation_id.clone()));
        }

        let (parent, prompt) = match plan {
            Plan::Send { parent, prompt } => {
                let root = state.store.create_conversation(conversation_id);
                let parent = parent
                    .or_else(|| state.current_leaf(conversation_id))
                    .unwrap_or(root);
                (parent, Some(prompt))
            }
            Plan::Edit {
                message_id,
                content,
                extra,
            } => {
                let original = state.lookup(conversation_id, message_id, MessageKind::User)?;
                let parent = original.parent.ok_or(ChatError::UnexpectedKind {
                    message_id,
                    expected: MessageKind::User.as_str(),
                    actual: MessageKind::Root.as_str(),
                })?;
                let extra = extra.unwrap_or_else(|| original.extra.clone());
                (parent, Some(Prompt::new(content, extra)))
            }
            Plan::Regenerate { message_id } => {
                let original = state.lookup(conversation_id, message_id, MessageKind::Assistant)?;
                let parent = original.parent.ok_or(ChatError::UnexpectedKind {
                    message_id,
                    expected: MessageKind::Assistant.as_str(),
                    actual: MessageKind::Root.as_str(),
                })?;
                (parent, None)
            }
        };

        let user_message = match prompt {
            Some(prompt) => Some(state.store.append(
                conversation_id,
                parent,
                MessageDraft::user(prompt.content, prompt.extra),
            )?),
            None => None,
        };
        let reply_parent = user_message.unwrap_or(parent);
        let request = self.build_request(&state.store, conversation_id, reply_parent);

        let mut assembler = StreamingAssembler::new();
        let pending = assembler.start(
            &mut state.store,
            conversation_id,
            reply_parent,
            Some(self.model.name().to_string()),
        )?;

        let cancel = CancellationToken::new();
        state.active.insert(
            conversation_id.clone(),
            ActiveGeneration {
                pending: assembler.pending().map(PendingMessage::snapshot),
                cancel: cancel.clone(),
            },
        );
        state.current_leaf.insert(conversation_id.clone(), pending);
        let to_persist = user_message.map(|_| state.store.get(conversation_id));
        drop(state);

        tracing::debug!(
            "generating {} under {} in {} with {}",
            pending,
            reply_parent,
            conversation_id,
            self.model.name()
        );
        tokio::spawn(Self::run_generation(
            Arc::clone(&self.shared),
            Arc::clone(&self.model),
            request,
            conversation_id.clone(),
            assembler,
            cancel,
            self.event_tx.clone(),
            to_persist,
        ));

        Ok(StartedGeneration {
            user_message,
            pending,
        })
    }

    /// History sent to the model: the path from the root down to `parent`
    fn build_request(
        &self,
        store: &MessageStore,
        conversation_id: &ConversationId,
        parent: MessageId,
    ) -> ChatRequest {
        let path = store
            .nodes(conversation_id)
            .map(|nodes| tree::resolve_path(nodes, Some(parent)))
            .unwrap_or_default();

        let history: Vec<ChatMessage> = self
            .system_message
            .iter()
            .map(|s| ChatMessage::system(ChatPayload::text(s)))
            .chain(path.iter().filter_map(|d| d.message.to_chat_message()))
            .collect();
        ChatRequest::with_options(&history, self.options.clone())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_generation(
        shared: Arc<Shared<S>>,
        model: Arc<dyn ChatModel + Send + Sync>,
        request: ChatRequest,
        conversation_id: ConversationId,
        mut assembler: StreamingAssembler,
        cancel: CancellationToken,
        event_tx: mpsc::UnboundedSender<EngineEvent>,
        to_persist: Option<Vec<Message>>,
    ) {
        if let Some(messages) = to_persist {
            Self::persist(&shared, &conversation_id, &messages, &event_tx).await;
        }

        let outcome = Self::stream_response(
            &shared,
            model.as_ref(),
            &request,
            &conversation_id,
            &mut assembler,
            &cancel,
            &event_tx,
        )
        .await;

        let (event, committed) = Self::settle(&shared, &conversation_id, &mut assembler, outcome);
        if let Some(messages) = committed {
            Self::persist(&shared, &conversation_id, &messages, &event_tx).await;
        }
        shared.finish_active(&conversation_id);
        let _ = event_tx.send(event);
    }

    async fn stream_response(
        shared: &Shared<S>,
        model: &(dyn ChatModel + Send + Sync),
        request: &ChatRequest,
        conversation_id: &ConversationId,
        assembler: &mut StreamingAssembler,
        cancel: &CancellationToken,
        event_tx: &mpsc::UnboundedSender<EngineEvent>,
    ) -> Outcome {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            opened = model.stream_chat(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("failed to open stream for {}: {}", conversation_id, e);
                return Outcome::Failed(e.into());
            }
        };

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(chunk)) => {
                    if assembler.apply(&chunk).is_some() && !chunk.is_empty() {
                        if let Some(snapshot) = assembler.pending().map(PendingMessage::snapshot) {
                            shared.update_pending(conversation_id, snapshot.clone());
                            let _ = event_tx.send(EngineEvent::PendingUpdated {
                                conversation_id: conversation_id.clone(),
                                message: snapshot,
                            });
                        }
                    }
                    if chunk.done {
                        return Outcome::Completed;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("stream for {} failed: {}", conversation_id, e);
                    return Outcome::Failed(e.into());
                }
                None => return Outcome::Completed,
            }
        }
    }

    /// Commit or discard the pending message. Returns the event to report and,
    /// on commit, the messages to persist.
    fn settle(
        shared: &Shared<S>,
        conversation_id: &ConversationId,
        assembler: &mut StreamingAssembler,
        outcome: Outcome,
    ) -> (EngineEvent, Option<Vec<Message>>) {
        let mut state = shared.lock();
        let State {
            store,
            active,
            current_leaf,
        } = &mut *state;

        let pending = assembler.pending().map(|p| (p.id, p.parent));
        let result = match outcome {
            Outcome::Completed => assembler.commit(store).map(|id| (id, false)),
            Outcome::Cancelled => assembler.cancel(store).map(|id| (id, true)),
            Outcome::Failed(reason) => {
                assembler.fail(reason.clone());
                Err(ChatError::Generation(reason))
            }
        };
        if let Some(active) = active.get_mut(conversation_id) {
            active.pending = None;
        }

        match result {
            Ok((message_id, cancelled)) => (
                EngineEvent::Committed {
                    conversation_id: conversation_id.clone(),
                    message_id,
                    cancelled,
                },
                Some(store.get(conversation_id)),
            ),
            Err(e) => {
                if let Some((pending_id, parent)) = pending {
                    if current_leaf.get(conversation_id) == Some(&pending_id) {
                        current_leaf.insert(conversation_id.clone(), parent);
                    }
                }
                let reason = match e {
                    ChatError::Generation(reason) => reason,
                    other => GenerationError::InvalidResponse(other.to_string()),
                };
                tracing::debug!("generation in {} failed: {}", conversation_id, reason);
                (
                    EngineEvent::Failed {
                        conversation_id: conversation_id.clone(),
                        reason,
                    },
                    None,
                )
            }
        }
    }

    async fn persist(
        shared: &Shared<S>,
        conversation_id: &ConversationId,
        messages: &[Message],
        event_tx: &mpsc::UnboundedSender<EngineEvent>,
    ) {
        if let Err(e) = shared.storage.save(conversation_id, messages).await {
            tracing::error!("failed to save conversation {}: {:#}", conversation_id, e);
            let _ = event_tx.send(EngineEvent::Error(format!("Save failed: {}", e)));
        }
    }
}
