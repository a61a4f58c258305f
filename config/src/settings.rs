//! Application settings management

use crate::PathManager;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

/// Application settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL of the inference server (llama-server or any OpenAI-compatible endpoint)
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Optional bearer token, for servers started with `--api-key`
    pub api_key: Option<String>,
    /// Model name sent with every completion request
    pub default_model: Option<String>,
    /// System message prepended to every request
    pub system_message: Option<String>,
    /// Render streamed reasoning content
    #[serde(default)]
    pub show_reasoning: bool,
    /// Sampling parameters (temperature, top_k, ...) forwarded verbatim to the server
    #[serde(default)]
    pub sampling: toml::Table,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_key: None,
            default_model: None,
            system_message: None,
            show_reasoning: false,
            sampling: toml::Table::new(),
        }
    }
}

impl Settings {
    /// Load settings from the settings file, or return defaults if not found
    pub fn load() -> Self {
        let Some(path) = PathManager::settings_path() else {
            return Self::default();
        };

        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("using default settings: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Save settings to the settings file
    pub fn save(&self) -> Result<()> {
        let path = PathManager::settings_path().context("Could not determine settings path")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config dir")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, content).context("Failed to write settings")?;
        Ok(())
    }

    /// Sampling parameters as a JSON object, ready to be flattened into a request body.
    pub fn sampling_params(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(&self.sampling) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.server_url, DEFAULT_SERVER_URL);
        assert!(settings.sampling.is_empty());
        assert!(!settings.show_reasoning);
    }

    #[test]
    fn test_sampling_params_pass_through() {
        let settings: Settings = toml::from_str(
            r#"
            server_url = "http://localhost:9000"
            default_model = "llama"

            [sampling]
            temperature = 0.7
            top_k = 40
            samplers = "edkypmxt"
            "#,
        )
        .unwrap();

        let params = settings.sampling_params();
        assert_eq!(settings.server_url, "http://localhost:9000");
        assert_eq!(params["temperature"], serde_json::json!(0.7));
        assert_eq!(params["top_k"], serde_json::json!(40));
        assert_eq!(params["samplers"], serde_json::json!("edkypmxt"));
    }

    #[test]
    fn test_settings_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("wgpt-settings-{}", std::process::id()));
        let path = dir.join("settings.toml");

        let mut settings = Settings::default();
        settings.system_message = Some("Be brief.".to_string());
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.system_message.as_deref(), Some("Be brief."));

        let _ = fs::remove_dir_all(dir);
    }
}
