// src/conversation/store.rs
// Ordered message log for one conversation, with snapshot persistence

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use super::budget;
use super::message::{FileRef, Message, Role};
use crate::error::{ChatError, Result};
use crate::storage::{KeyValueStore, conversation_key};

/// Append-only log of role-tagged messages.
///
/// The only mutable entry is an in-flight assistant tail created with
/// [`MessageStore::begin_in_flight`] while a response streams in.
pub struct MessageStore {
    messages: Vec<Message>,
    in_flight: bool,
    kv: Arc<dyn KeyValueStore>,
}

impl MessageStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            messages: Vec::new(),
            in_flight: false,
            kv,
        }
    }

    /// Append a message to the end of the log and return a copy of it.
    ///
    /// Fails while an in-flight assistant tail exists, since that tail must
    /// stay last until it is finished or abandoned.
    pub fn append(
        &mut self,
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        attached_file: Option<FileRef>,
    ) -> Result<Message> {
        if self.in_flight {
            return Err(ChatError::InvalidInput(
                "cannot append while an assistant message is in flight".into(),
            ));
        }
        let message = Message {
            role,
            content: content.into(),
            timestamp,
            attached_file,
        };
        self.messages.push(message.clone());
        Ok(message)
    }

    /// Owned copy of the full log
    pub fn history(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Last `count` messages in order
    pub fn last_messages(&self, count: usize) -> Vec<Message> {
        let start = self.messages.len().saturating_sub(count);
        self.messages[start..].to_vec()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Start an empty assistant tail that streaming deltas will grow
    pub fn begin_in_flight(&mut self, timestamp: DateTime<Utc>) -> Result<()> {
        if self.in_flight {
            return Err(ChatError::InvalidInput(
                "an assistant message is already in flight".into(),
            ));
        }
        self.messages
            .push(Message::new(Role::Assistant, String::new(), timestamp));
        self.in_flight = true;
        Ok(())
    }

    /// Replace the content of the in-flight assistant tail.
    ///
    /// Silently does nothing when there is no in-flight assistant tail.
    pub fn mutate_tail(&mut self, content: impl Into<String>) {
        if !self.in_flight {
            return;
        }
        if let Some(last) = self.messages.last_mut()
            && last.role == Role::Assistant
        {
            last.content = content.into();
        }
    }

    /// Freeze the in-flight tail with its final text. Appends a new assistant
    /// message when nothing was in flight.
    pub fn finish_in_flight(&mut self, final_text: impl Into<String>) -> Message {
        let final_text = final_text.into();
        if self.in_flight {
            self.in_flight = false;
            if let Some(last) = self.messages.last_mut() {
                last.content = final_text;
                return last.clone();
            }
        }
        let message = Message::assistant(final_text);
        self.messages.push(message.clone());
        message
    }

    /// Drop the in-flight tail, if any
    pub fn abandon_in_flight(&mut self) {
        if self.in_flight {
            self.in_flight = false;
            self.messages.pop();
        }
    }

    /// Restore the log to an earlier length. Used to undo a cancelled exchange.
    pub(crate) fn rollback_to(&mut self, len: usize) {
        self.in_flight = false;
        self.messages.truncate(len);
    }

    /// Clear the log, optionally seeding a system prompt
    pub fn reset(&mut self, system_prompt: Option<&str>) {
        self.messages.clear();
        self.in_flight = false;
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            self.messages.push(Message::system(prompt));
        }
    }

    /// Estimated token size of the whole log
    pub fn approximate_token_count(&self) -> u64 {
        budget::estimate_message_tokens(&self.messages)
    }

    /// Lossy request view that fits `limit_tokens`; the stored log is untouched
    pub fn truncate_for_context(&self, limit_tokens: u64) -> Vec<Message> {
        budget::truncate_for_context(&self.messages, limit_tokens)
    }

    /// Persist the log as one JSON snapshot under `conversation_<id>`.
    ///
    /// An in-flight tail is never written.
    pub async fn save(&self, id: &str) -> Result<()> {
        let committed = if self.in_flight {
            &self.messages[..self.messages.len() - 1]
        } else {
            &self.messages[..]
        };
        let json = serde_json::to_string(committed)?;
        self.kv.set(&conversation_key(id), json).await?;
        debug!(conversation = %id, messages = committed.len(), "Saved conversation");
        Ok(())
    }

    /// Replace the log with the saved snapshot for `id`.
    ///
    /// Returns false and leaves the log unchanged when nothing is stored or
    /// the snapshot does not parse.
    pub async fn load(&mut self, id: &str) -> bool {
        let key = conversation_key(id);
        let raw = match self.kv.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                warn!(conversation = %id, error = %e, "Failed to read saved conversation");
                return false;
            }
        };
        match serde_json::from_str::<Vec<Message>>(&raw) {
            Ok(messages) => {
                debug!(conversation = %id, messages = messages.len(), "Loaded conversation");
                self.messages = messages;
                self.in_flight = false;
                true
            }
            Err(e) => {
                warn!(conversation = %id, error = %e, "Saved conversation is malformed, ignoring");
                false
            }
        }
    }

    /// Delete the saved snapshot for `id`
    pub async fn forget(&self, id: &str) -> Result<()> {
        self.kv.remove(&conversation_key(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;

    fn store() -> (MessageStore, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        (MessageStore::new(kv.clone()), kv)
    }

    // ========================================================================
    // Append / history
    // ========================================================================

    #[test]
    fn test_append_preserves_order() {
        let (mut s, _) = store();
        s.append(Role::System, "sys", Utc::now(), None).unwrap();
        s.append(Role::User, "one", Utc::now(), None).unwrap();
        let created = s.append(Role::Assistant, "two", Utc::now(), None).unwrap();
        assert_eq!(created.content, "two");

        let roles: Vec<Role> = s.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[test]
    fn test_history_is_a_copy() {
        let (mut s, _) = store();
        s.append(Role::User, "hi", Utc::now(), None).unwrap();
        let mut copy = s.history();
        copy[0].content = "changed".into();
        copy.push(Message::user("extra"));
        assert_eq!(s.history()[0].content, "hi");
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_last_messages() {
        let (mut s, _) = store();
        for i in 0..5 {
            s.append(Role::User, i.to_string(), Utc::now(), None).unwrap();
        }
        let last = s.last_messages(2);
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].content, "3");
        assert_eq!(s.last_messages(10).len(), 5);
    }

    // ========================================================================
    // In-flight tail
    // ========================================================================

    #[test]
    fn test_mutate_tail_requires_in_flight() {
        let (mut s, _) = store();
        s.append(Role::Assistant, "done", Utc::now(), None).unwrap();
        s.mutate_tail("overwritten");
        assert_eq!(s.history()[0].content, "done");
    }

    #[test]
    fn test_in_flight_lifecycle() {
        let (mut s, _) = store();
        s.append(Role::User, "q", Utc::now(), None).unwrap();
        s.begin_in_flight(Utc::now()).unwrap();
        s.mutate_tail("Hel");
        s.mutate_tail("Hello");
        assert_eq!(s.history()[1].content, "Hello");
        assert!(s.append(Role::User, "nope", Utc::now(), None).is_err());
        assert!(s.begin_in_flight(Utc::now()).is_err());

        let finished = s.finish_in_flight("Hello!");
        assert_eq!(finished.role, Role::Assistant);
        assert_eq!(s.len(), 2);
        assert!(!s.is_in_flight());

        // Frozen now
        s.mutate_tail("changed");
        assert_eq!(s.history()[1].content, "Hello!");
    }

    #[test]
    fn test_finish_without_in_flight_appends() {
        let (mut s, _) = store();
        s.append(Role::User, "q", Utc::now(), None).unwrap();
        s.finish_in_flight("answer");
        assert_eq!(s.len(), 2);
        assert_eq!(s.history()[1].content, "answer");
    }

    #[test]
    fn test_abandon_in_flight() {
        let (mut s, _) = store();
        s.append(Role::User, "q", Utc::now(), None).unwrap();
        s.begin_in_flight(Utc::now()).unwrap();
        s.mutate_tail("partial");
        s.abandon_in_flight();
        assert_eq!(s.len(), 1);
        // No-op when nothing is in flight
        s.abandon_in_flight();
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_reset_with_system_prompt() {
        let (mut s, _) = store();
        s.append(Role::User, "q", Utc::now(), None).unwrap();
        s.reset(Some("Be brief"));
        assert_eq!(s.len(), 1);
        assert_eq!(s.history()[0].role, Role::System);
        s.reset(Some("   "));
        assert!(s.is_empty());
    }

    // ========================================================================
    // Token accounting
    // ========================================================================

    #[test]
    fn test_approximate_token_count() {
        let (mut s, _) = store();
        assert_eq!(s.approximate_token_count(), 0);
        s.append(Role::User, "x".repeat(35), Utc::now(), None).unwrap();
        s.append(Role::Assistant, "x".repeat(36), Utc::now(), None).unwrap();
        assert_eq!(s.approximate_token_count(), (10 + 4) + (11 + 4));
    }

    #[test]
    fn test_truncate_for_context_leaves_log_intact() {
        let (mut s, _) = store();
        s.append(Role::System, "sys", Utc::now(), None).unwrap();
        for _ in 0..40 {
            s.append(Role::User, "u".repeat(400), Utc::now(), None).unwrap();
        }
        let view = s.truncate_for_context(2000);
        assert!(view.len() < s.len());
        assert_eq!(view[0].role, Role::System);
        assert_eq!(s.len(), 41);
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    #[tokio::test]
    async fn test_save_then_load() {
        let (mut s, kv) = store();
        s.append(Role::User, "hi", Utc::now(), None).unwrap();
        s.append(
            Role::Assistant,
            "hello",
            Utc::now(),
            Some(FileRef::new("f1", "a.txt", "text/plain")),
        )
        .unwrap();
        s.save("abc").await.unwrap();

        let mut fresh = MessageStore::new(kv);
        assert!(fresh.load("abc").await);
        assert_eq!(fresh.history(), s.history());
    }

    #[tokio::test]
    async fn test_load_missing_returns_false() {
        let (mut s, _) = store();
        s.append(Role::User, "keep", Utc::now(), None).unwrap();
        assert!(!s.load("missing_id").await);
        assert_eq!(s.len(), 1);
    }

    #[tokio::test]
    async fn test_load_malformed_returns_false() {
        let (mut s, kv) = store();
        kv.set("conversation_bad", "{not json".into()).await.unwrap();
        s.append(Role::User, "keep", Utc::now(), None).unwrap();
        assert!(!s.load("bad").await);
        assert_eq!(s.history()[0].content, "keep");
    }

    #[tokio::test]
    async fn test_save_skips_in_flight_tail() {
        let (mut s, kv) = store();
        s.append(Role::User, "q", Utc::now(), None).unwrap();
        s.begin_in_flight(Utc::now()).unwrap();
        s.mutate_tail("partial");
        s.save("c").await.unwrap();

        let mut fresh = MessageStore::new(kv);
        assert!(fresh.load("c").await);
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn test_forget_removes_snapshot() {
        let (mut s, kv) = store();
        s.append(Role::User, "q", Utc::now(), None).unwrap();
        s.save("gone").await.unwrap();
        s.forget("gone").await.unwrap();
        assert!(kv.get("conversation_gone").await.unwrap().is_none());
    }
}
