//! Local model registry (`models.yaml`) and the props document derived from it
//!
//! ```yaml
//! models:
//!   llama:
//!     path: llama-3.1-8b-instruct.Q4_K_M.gguf
//!     port: 8080
//!     display_name: Llama 3.1 8B
//!   qwen:
//!     path: qwen2.5-coder-7b.gguf
//!     port: 8081
//! ```
//!
//! Entry order is significant: the first model is the default one.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MODEL_TYPE: &str = "openai";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Model file, relative to the models directory
    pub path: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<(String, ModelEntry)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProps {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Document served to the front-end so it can populate its model selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Props {
    pub app_name: String,
    pub default_model: Option<String>,
    pub models: Vec<ModelProps>,
}

impl ModelRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("{} not found", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(content)?;
        let models = document
            .get("models")
            .and_then(|m| m.as_mapping())
            .ok_or_else(|| anyhow!("models.yaml must contain a 'models:' key"))?;

        let mut entries = Vec::with_capacity(models.len());
        for (name, entry) in models {
            let name = name
                .as_str()
                .ok_or_else(|| anyhow!("model names must be strings"))?
                .to_string();
            let entry: ModelEntry = serde_yaml::from_value(entry.clone())
                .with_context(|| format!("invalid entry for model '{}'", name))?;
            entries.push((name, entry));
        }

        Ok(Self { models: entries })
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModelEntry)> {
        self.models.iter().map(|(n, e)| (n.as_str(), e))
    }

    pub fn default_model(&self) -> Option<&str> {
        self.models.first().map(|(n, _)| n.as_str())
    }

    /// Local server URL for a model (each model gets its own llama-server port)
    pub fn endpoint(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|entry| format!("http://127.0.0.1:{}", entry.port))
    }

    pub fn props(&self, app_name: &str) -> Props {
        Props {
            app_name: app_name.to_string(),
            default_model: self.default_model().map(str::to_string),
            models: self
                .iter()
                .map(|(name, entry)| ModelProps {
                    name: name.to_string(),
                    display_name: entry.display_name.clone().unwrap_or_else(|| name.to_string()),
                    kind: entry
                        .kind
                        .clone()
                        .unwrap_or_else(|| DEFAULT_MODEL_TYPE.to_string()),
                })
                .collect(),
        }
    }
}

impl Props {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
