// src/config/env.rs
// Environment-based configuration

use std::path::PathBuf;
use tracing::{debug, warn};

/// Values read from the process environment
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// OPENAI_API_KEY
    pub api_key: Option<String>,
    /// OPENAI_BASE_URL
    pub base_url: Option<String>,
    /// CHATLINE_DEFAULT_MODEL
    pub default_model: Option<String>,
    /// CHATLINE_DATA_DIR
    pub data_dir: Option<PathBuf>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        let config = Self {
            api_key: read_var("OPENAI_API_KEY"),
            base_url: read_var("OPENAI_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            default_model: read_var("CHATLINE_DEFAULT_MODEL"),
            data_dir: read_var("CHATLINE_DATA_DIR").map(PathBuf::from),
        };
        config.log_status();
        config
    }

    fn log_status(&self) {
        if self.api_key.is_none() {
            debug!("OPENAI_API_KEY not set; falling back to stored key");
        }
        if let Some(url) = &self.base_url
            && !url.starts_with("http://")
            && !url.starts_with("https://")
        {
            warn!(base_url = %url, "OPENAI_BASE_URL has no http(s) scheme");
        }
    }
}

/// Read a single variable, filtering empty values
fn read_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
