// src/lib.rs

pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod preset;
pub mod storage;

#[cfg(test)]
mod test_support;

// Export commonly used items
pub use config::{ClientSettings, Credentials};
pub use conversation::{ChatEvent, ConversationController, SendOptions, StreamHandle, StreamOutcome};
pub use error::{ChatError, Result};
pub use preset::{Preset, PresetStore};
pub use storage::{FileKvStore, KeyValueStore, MemoryKvStore};
