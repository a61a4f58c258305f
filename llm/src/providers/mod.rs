pub(crate) mod llama;

pub use llama::{LlamaChatModel, LlamaProvider};
