// src/llm/request.rs
// Chat completion request body (OpenAI-compatible)

use serde::Serialize;
use serde_json::Value;

use crate::conversation::Message;

/// Wire form of a message: role and content only
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

/// Chat completion request; streams unless told otherwise
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>, // "auto" when tools are present
}

impl ChatRequest {
    /// Create a streaming request with the default sampling parameters
    pub fn new(model: impl Into<String>, messages: &[Message]) -> Self {
        Self {
            model: model.into(),
            messages: messages.iter().map(WireMessage::from).collect(),
            temperature: crate::config::DEFAULT_TEMPERATURE,
            max_tokens: crate::config::DEFAULT_MAX_TOKENS,
            stream: true,
            tools: None,
            tool_choice: None,
        }
    }

    /// Set tools for function calling; empty lists are dropped
    pub fn with_tools(mut self, tools: Option<Vec<Value>>) -> Self {
        self.tools = tools.filter(|t| !t.is_empty());
        self.tool_choice = self.tools.as_ref().map(|_| "auto".to_string());
        self
    }

    /// Ask for the whole reply in one response instead of a stream
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set maximum output tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature (clamped to 0.0..=2.0)
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
