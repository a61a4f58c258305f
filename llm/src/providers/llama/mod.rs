pub(crate) mod chat;
mod provider;

pub use chat::LlamaChatModel;
pub use provider::LlamaProvider;
