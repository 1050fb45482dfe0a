// src/error.rs
// Error taxonomy for the chat core

use thiserror::Error;

/// Main error type for the chatline library
#[derive(Error, Debug)]
pub enum ChatError {
    /// Non-2xx response from the API. `message` is the server-provided text.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Connection refused, DNS/TLS failure, abrupt disconnect
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame did not decode into the expected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream cancelled")]
    Cancelled,

    /// An assistant run reached a terminal status other than completed
    #[error("run {status}: {message}")]
    RunFailed { status: String, message: String },

    #[error("a stream is already in progress for this conversation")]
    StreamInProgress,

    #[error("API key is required")]
    MissingCredentials,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Convenience type alias for Result using ChatError
pub type Result<T> = std::result::Result<T, ChatError>;

impl ChatError {
    /// Text surfaced to the caller through `ChatEvent::Error`.
    ///
    /// API errors report the server's message verbatim so the UI can show it
    /// inline; cancellation is always reported as `"cancelled"`.
    pub fn reason(&self) -> String {
        match self {
            ChatError::Api { message, .. } => message.clone(),
            ChatError::Transport(msg) | ChatError::Protocol(msg) => msg.clone(),
            ChatError::Cancelled => "cancelled".to_string(),
            ChatError::RunFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// True for failures of the connection itself (not of the payload)
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatError::Api { .. } | ChatError::Transport(_) | ChatError::Http(_)
        )
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ChatError::Cancelled
        } else {
            ChatError::Transport(err.to_string())
        }
    }
}
