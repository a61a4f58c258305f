use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

pub mod api;
pub mod client;
pub mod error;
pub mod providers;
pub use api::*;
pub use error::TransportError;
pub use providers::{LlamaChatModel, LlamaProvider};

/// Stream of completion increments. Dropping it cancels the underlying request.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, TransportError>> + Send>>;

/// Entry in the model selector
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
        }
    }

    /// Get the display name, falling back to the name if not set
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[async_trait]
pub trait ChatModel {
    fn name(&self) -> &str;

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, TransportError>;
}

// Blanket implementation for Arc<dyn ChatModel> to make it easier to work with
#[async_trait]
impl ChatModel for Arc<dyn ChatModel + Send + Sync> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream, TransportError> {
        (**self).stream_chat(request).await
    }
}

#[async_trait]
pub trait ModelProvider {
    /// List the models the server offers
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDefinition>>;

    /// Create a chat model by name, returned as Arc for sharing across threads
    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>>;
}
