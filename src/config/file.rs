// src/config/file.rs
// File-based configuration from ~/.chatline/config.toml

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Top-level config structure
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct ChatlineConfig {
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub models: ModelsSection,
}

/// `[chat]` section
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct ChatSection {
    pub default_model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub base_url: Option<String>,
    /// Context window for models missing from the built-in table
    pub fallback_context_limit: Option<u64>,
}

/// `[models]` section
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct ModelsSection {
    /// Per-model context window overrides
    #[serde(default)]
    pub context_limits: HashMap<String, u64>,
}

impl ChatlineConfig {
    /// Load config from ~/.chatline/config.toml
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path; missing or invalid files yield defaults
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        super::chatline_home().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[chat]
default_model = "gpt-4o"
temperature = 0.2
max_tokens = 512

[models.context_limits]
"my-local-model" = 4096
"#;
        let config: ChatlineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.chat.default_model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.chat.max_tokens, Some(512));
        assert_eq!(config.models.context_limits.get("my-local-model"), Some(&4096));
    }

    #[test]
    fn test_parse_empty_config() {
        let config: ChatlineConfig = toml::from_str("").unwrap();
        assert_eq!(config, ChatlineConfig::default());
    }

    #[test]
    fn test_load_invalid_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chat\nbroken").unwrap();
        assert_eq!(ChatlineConfig::load_from(&path), ChatlineConfig::default());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatlineConfig::load_from(&dir.path().join("absent.toml"));
        assert_eq!(config, ChatlineConfig::default());
    }
}
