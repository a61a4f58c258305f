//! Branching conversation core: message tree, leaf-path resolution,
//! streaming response assembly and generation control.

pub mod assembler;
pub mod engine;
pub mod error;
pub mod ids;
pub mod message;
pub mod storage;
pub mod store;
pub mod tree;

#[cfg(test)]
mod mock;

pub use assembler::{AssemblerState, PendingMessage, StreamingAssembler};
pub use engine::{ConversationView, EngineEvent, GenerationController, Prompt, StartedGeneration};
pub use error::{ChatError, GenerationError};
pub use ids::{ConversationId, MessageId};
pub use message::{ExtraItem, Message, MessageDraft, MessageKind};
pub use storage::{ConversationInfo, ConversationStorage, MemoryStorage};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use store::{MessageMap, MessageStore};
pub use tree::{MessageDisplay, check_integrity, find_leaf_node, natural_leaf, resolve_path};
