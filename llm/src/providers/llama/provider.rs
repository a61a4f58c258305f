use crate::client::Client;
use crate::{ChatModel, ModelDefinition, ModelProvider};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::sync::Arc;

use super::chat::api::{ListModelsResponse, PropsResponse};
use super::chat::LlamaChatModel;

#[derive(Clone)]
pub struct LlamaProvider {
    client: Client,
    base_url: String,
}

impl LlamaProvider {
    /// Create a provider for a server at `base_url` (e.g. `http://127.0.0.1:8080`).
    pub fn new(base_url: &str, api_key: Option<&str>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", api_key))
                    .context("Invalid API key format")?,
            );
        }

        Ok(LlamaProvider {
            client: Client::with_headers(headers)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn props_url(&self) -> String {
        format!("{}/props", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/v1/models", self.base_url)
    }
}

#[async_trait]
impl ModelProvider for LlamaProvider {
    /// Reads the model list from `/props`; servers whose props carry no model
    /// list are asked through `/v1/models` instead.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelDefinition>> {
        match self.client.get::<_, PropsResponse>(self.props_url()).await {
            Ok(PropsResponse { models: Some(models) }) => return Ok(models),
            Ok(_) => {}
            Err(e) => tracing::debug!("props unavailable, falling back to /v1/models: {}", e),
        }

        let response: ListModelsResponse = self.client.get(self.models_url()).await?;
        Ok(response
            .data
            .into_iter()
            .map(|m| ModelDefinition::new(m.id))
            .collect())
    }

    fn create_chat_model(&self, model_name: &str) -> Option<Arc<dyn ChatModel + Send + Sync>> {
        Some(Arc::new(LlamaChatModel::new(
            self.client.clone(),
            self.base_url.clone(),
            model_name.to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let provider = LlamaProvider::new("http://127.0.0.1:8080/", None).unwrap();
        assert_eq!(provider.base_url(), "http://127.0.0.1:8080");
        assert_eq!(provider.models_url(), "http://127.0.0.1:8080/v1/models");
    }

    #[test]
    fn test_props_models_parse() {
        let props: PropsResponse = serde_json::from_str(
            r#"{"app_name":"WarriorGPT","default_model":"llama",
                "models":[{"name":"llama","display_name":"Llama 3","type":"openai"},{"name":"qwen"}]}"#,
        )
        .unwrap();

        let models = props.models.unwrap();
        assert_eq!(models[0].label(), "Llama 3");
        assert_eq!(models[1].label(), "qwen");
    }

    #[test]
    fn test_llama_server_props_have_no_models() {
        let props: PropsResponse =
            serde_json::from_str(r#"{"default_generation_settings":{"n_ctx":4096},"total_slots":1}"#)
                .unwrap();
        assert!(props.models.is_none());
    }
}
