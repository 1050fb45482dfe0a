// src/conversation/mod.rs
// Conversation state: messages, context budget, persistence, orchestration

pub mod budget;
mod controller;
mod message;
mod store;

pub use controller::{ConversationController, SendOptions};
pub use message::{FileRef, Message, Role};
pub use store::MessageStore;
pub use crate::llm::streaming::{ChatEvent, StreamHandle, StreamOutcome};
