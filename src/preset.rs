// src/preset.rs
// Saved chat presets: model, system prompt and sampling settings under one id

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::conversation::SendOptions;
use crate::error::{ChatError, Result};
use crate::storage::{KeyValueStore, conversation_key};

/// Key holding the JSON array of presets
pub const PRESETS_KEY: &str = "chat_presets";

/// A named bundle of chat settings. The preset id doubles as the id of the
/// conversation started from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Preset {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            created_at: Utc::now(),
            last_updated: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Most recent change, used for list ordering
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.last_updated.unwrap_or(self.created_at)
    }

    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: (!self.tools.is_empty()).then(|| self.tools.clone()),
            attachment: None,
            system_prompt: self.system_prompt.clone(),
        }
    }
}

/// Preset list persisted as one JSON array in the key-value store
pub struct PresetStore {
    kv: Arc<dyn KeyValueStore>,
}

impl PresetStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// All presets, most recently updated first. An unreadable list is
    /// treated as empty.
    pub async fn list(&self) -> Result<Vec<Preset>> {
        let Some(raw) = self.kv.get(PRESETS_KEY).await? else {
            return Ok(Vec::new());
        };
        let mut presets: Vec<Preset> = match serde_json::from_str(&raw) {
            Ok(presets) => presets,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable preset list");
                return Ok(Vec::new());
            }
        };
        presets.sort_by_key(|p| std::cmp::Reverse(p.updated_at()));
        Ok(presets)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Preset>> {
        Ok(self.list().await?.into_iter().find(|p| p.id == id))
    }

    /// Insert or replace by id. Replacing keeps the original creation time
    /// and stamps `last_updated`.
    pub async fn upsert(&self, mut preset: Preset) -> Result<()> {
        if preset.id.trim().is_empty() {
            return Err(ChatError::InvalidInput("preset id must not be empty".into()));
        }
        let mut presets = self.list().await?;
        match presets.iter_mut().find(|p| p.id == preset.id) {
            Some(existing) => {
                preset.created_at = existing.created_at;
                preset.last_updated = Some(Utc::now());
                debug!(preset = %preset.id, "Updating preset");
                *existing = preset;
            }
            None => {
                info!(preset = %preset.id, name = %preset.name, "Preset added");
                presets.push(preset);
            }
        }
        self.write(&presets).await
    }

    /// Delete the preset and the conversation saved under its id.
    /// Returns false when no such preset existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut presets = self.list().await?;
        let before = presets.len();
        presets.retain(|p| p.id != id);
        if presets.len() == before {
            return Ok(false);
        }
        self.write(&presets).await?;
        self.kv.remove(&conversation_key(id)).await?;
        info!(preset = %id, "Preset removed");
        Ok(true)
    }

    async fn write(&self, presets: &[Preset]) -> Result<()> {
        let raw = serde_json::to_string(presets)?;
        self.kv.set(PRESETS_KEY, raw).await
    }
}
