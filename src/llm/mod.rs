// src/llm/mod.rs
// LLM module exports and submodule declarations

pub mod api;
pub mod assistant;
pub mod completion;
pub mod files;
pub mod http_client;
pub mod models;
pub mod request;
pub mod streaming;
pub mod transport;

pub use api::ApiClient;
pub use assistant::{AssistantsClient, RunHandle};
pub use completion::{Completion, Usage, complete};
pub use files::{FileCollaborator, OpenAiFiles};
pub use http_client::LlmHttpClient;
pub use transport::{ByteStream, HttpTransport, Transport};
