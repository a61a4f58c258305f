//! Persistence of conversation trees
//!
//! The generation controller only talks to [`ConversationStorage`]; the
//! medium behind it is interchangeable.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
pub use traits::{ConversationInfo, ConversationStorage};
