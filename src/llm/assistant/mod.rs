// src/llm/assistant/mod.rs
// Assistant threads and streamed runs

mod client;
pub mod types;

pub use client::{AssistantsClient, RunHandle};
pub use types::{Assistant, AssistantFile, CreateAssistantRequest, Run, RunStatus, Thread, ThreadMessage};
