// src/config/mod.rs
// Configuration: env + file merge, API credentials

pub mod env;
pub mod file;

pub use env::EnvConfig;
pub use file::ChatlineConfig;

use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::Result;
use crate::llm::models::{FALLBACK_CONTEXT_LIMIT, ModelLimits};
use crate::storage::KeyValueStore;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Key-value entry holding a user-supplied API key
pub const API_KEY_STORAGE_KEY: &str = "openai-api-key";

/// ~/.chatline
pub fn chatline_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatline")
}

/// Resolved client settings (env wins over file, file over built-ins)
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub default_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub data_dir: PathBuf,
    pub model_limits: ModelLimits,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::resolve(&ChatlineConfig::default(), &EnvConfig::default())
    }
}

impl ClientSettings {
    pub fn resolve(file: &ChatlineConfig, env: &EnvConfig) -> Self {
        let chat = &file.chat;
        let settings = Self {
            base_url: env
                .base_url
                .clone()
                .or_else(|| chat.base_url.clone())
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_model: env
                .default_model
                .clone()
                .or_else(|| chat.default_model.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: chat.temperature.unwrap_or(DEFAULT_TEMPERATURE).clamp(0.0, 2.0),
            max_tokens: chat.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            data_dir: env
                .data_dir
                .clone()
                .unwrap_or_else(|| chatline_home().join("data")),
            model_limits: ModelLimits::new(
                file.models.context_limits.clone(),
                chat.fallback_context_limit.unwrap_or(FALLBACK_CONTEXT_LIMIT),
            ),
        };
        debug!(
            base_url = %settings.base_url,
            default_model = %settings.default_model,
            "Resolved client settings"
        );
        settings
    }

    /// Load everything from the usual places
    pub fn load() -> Self {
        Self::resolve(&ChatlineConfig::load(), &EnvConfig::from_env())
    }

    /// The model to use when the caller names none (or an empty one)
    pub fn model_or_default<'a>(&'a self, model: Option<&'a str>) -> &'a str {
        model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn chat_completions_url(&self) -> String {
        self.endpoint("chat/completions")
    }
}

/// API credentials, passed explicitly to whatever issues requests.
///
/// `Debug` never prints the key.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.masked())
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        let key = api_key.into().trim().to_string();
        Self {
            api_key: (!key.is_empty()).then_some(key),
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Display form: first four + `...` + last four characters
    pub fn masked(&self) -> Option<String> {
        self.api_key.as_deref().map(mask_key)
    }

    /// Environment first, then the stored key
    pub async fn load(env: &EnvConfig, kv: &dyn KeyValueStore) -> Result<Self> {
        if let Some(key) = &env.api_key {
            debug!("Using API key from environment");
            return Ok(Self::new(key.as_str()));
        }
        let stored = kv.get(API_KEY_STORAGE_KEY).await?;
        Ok(stored.map(Self::new).unwrap_or_default())
    }

    /// Persist a user-supplied key
    pub async fn store(kv: &dyn KeyValueStore, api_key: &str) -> Result<Self> {
        let creds = Self::new(api_key);
        match creds.api_key() {
            Some(key) => {
                kv.set(API_KEY_STORAGE_KEY, key.to_string()).await?;
                info!(key = %mask_key(key), "API key saved");
            }
            None => kv.remove(API_KEY_STORAGE_KEY).await?,
        }
        Ok(creds)
    }

    pub async fn clear(kv: &dyn KeyValueStore) -> Result<()> {
        kv.remove(API_KEY_STORAGE_KEY).await?;
        info!("API key removed");
        Ok(())
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
