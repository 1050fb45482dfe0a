// src/llm/models.rs
// Per-model context window budgets

use std::collections::HashMap;

/// Context window used when a model is not in the table
pub const FALLBACK_CONTEXT_LIMIT: u64 = 8_192;

/// Known context windows, matched by longest prefix.
///
/// Dated snapshots (`gpt-4o-2024-08-06`) resolve through their family prefix.
const KNOWN_LIMITS: &[(&str, u64)] = &[
    ("gpt-4.1", 1_047_576),
    ("gpt-4.5", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4-1106", 128_000),
    ("gpt-4-0125", 128_000),
    ("gpt-4-vision", 128_000),
    ("gpt-4-32k", 32_768),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo-instruct", 4_096),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
];

/// Model -> context limit lookup with configurable overrides
#[derive(Debug, Clone)]
pub struct ModelLimits {
    overrides: HashMap<String, u64>,
    fallback: u64,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            fallback: FALLBACK_CONTEXT_LIMIT,
        }
    }
}

impl ModelLimits {
    pub fn new(overrides: HashMap<String, u64>, fallback: u64) -> Self {
        Self {
            overrides,
            fallback: fallback.max(1),
        }
    }

    /// Context window budget for `model`
    pub fn context_limit_for(&self, model: &str) -> u64 {
        if let Some(limit) = self.overrides.get(model) {
            return *limit;
        }
        KNOWN_LIMITS
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, limit)| *limit)
            .unwrap_or(self.fallback)
    }
}

/// Context limit using built-in table only
pub fn context_limit_for(model: &str) -> u64 {
    ModelLimits::default().context_limit_for(model)
}
