// src/conversation/controller.rs
// Orchestrates one conversation: history, request building, streaming, persistence

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::message::{FileRef, Message, Role};
use super::store::MessageStore;
use crate::config::{ClientSettings, Credentials};
use crate::error::{ChatError, Result};
use crate::llm::api::ApiClient;
use crate::llm::completion::{Completion, complete};
use crate::llm::files::FileCollaborator;
use crate::llm::http_client::LlmHttpClient;
use crate::llm::request::ChatRequest;
use crate::llm::streaming::{
    ChatEvent, EVENT_CHANNEL_CAPACITY, StreamHandle, StreamOutcome, chat_events,
};
use crate::llm::transport::Transport;
use crate::storage::KeyValueStore;

/// Per-send overrides
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Function tools; sent with `tool_choice: "auto"`
    pub tools: Option<Vec<Value>>,
    /// File to reference from the user turn
    pub attachment: Option<FileRef>,
    /// Seeded as the first message when the conversation is empty
    pub system_prompt: Option<String>,
}

/// Releases the per-conversation stream slot when dropped
struct StreamSlot(Arc<AtomicBool>);

impl StreamSlot {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChatError::StreamInProgress)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One conversation with a chat-completion endpoint.
///
/// At most one reply streams at a time; a second `send` while one is in
/// progress fails with [`ChatError::StreamInProgress`].
pub struct ConversationController {
    id: String,
    store: Arc<Mutex<MessageStore>>,
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    settings: ClientSettings,
    files: Option<Arc<dyn FileCollaborator>>,
    streaming: Arc<AtomicBool>,
}

impl ConversationController {
    pub fn new(
        id: impl Into<String>,
        kv: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        settings: ClientSettings,
    ) -> Self {
        Self {
            id: id.into(),
            store: Arc::new(Mutex::new(MessageStore::new(kv))),
            transport,
            credentials,
            settings,
            files: None,
            streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resolve attachments through `files`
    pub fn with_files(mut self, files: Arc<dyn FileCollaborator>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.id
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Snapshot of the conversation, including a partially streamed reply
    pub async fn history(&self) -> Vec<Message> {
        self.store.lock().await.history()
    }

    pub async fn approximate_token_count(&self) -> u64 {
        self.store.lock().await.approximate_token_count()
    }

    /// Replace the history with the saved snapshot, if there is one
    pub async fn load(&self) -> Result<bool> {
        let _slot = StreamSlot::acquire(&self.streaming)?;
        Ok(self.store.lock().await.load(&self.id).await)
    }

    /// Drop the history and its saved snapshot
    pub async fn clear(&self, system_prompt: Option<&str>) -> Result<()> {
        let _slot = StreamSlot::acquire(&self.streaming)?;
        let mut store = self.store.lock().await;
        store.reset(system_prompt);
        store.forget(&self.id).await?;
        info!(conversation = %self.id, "Conversation cleared");
        Ok(())
    }

    /// Send a user message and stream the reply.
    ///
    /// Rejected before any I/O when credentials are missing, the message is
    /// empty or another reply is still streaming.
    #[instrument(skip(self, text, options), fields(conversation = %self.id))]
    pub async fn send(&self, text: &str, model: Option<&str>, options: SendOptions) -> Result<StreamHandle> {
        self.check_send(text, &options)?;
        let slot = StreamSlot::acquire(&self.streaming)?;

        let model = self.settings.model_or_default(model).to_string();
        let (rollback_len, context) = self.begin_turn(text, &model, &options).await?;

        let body = match self.build_request(&model, &context, options).to_value() {
            Ok(body) => body,
            Err(e) => {
                self.store.lock().await.rollback_to(rollback_len);
                return Err(e.into());
            }
        };
        debug!(model = %model, messages = context.len(), "Request built");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let token = CancellationToken::new();
        let exchange = Exchange {
            conversation_id: self.id.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
            credentials: self.credentials.clone(),
            endpoint: self.settings.chat_completions_url(),
            body,
            rollback_len,
            tx,
            token: token.clone(),
        };

        let task = tokio::spawn(exchange.run(slot));
        Ok(StreamHandle::new(rx, token, task))
    }

    /// Send a user message and wait for the whole reply in one response.
    ///
    /// Same checks and history updates as [`send`](Self::send); a failed
    /// request keeps the user turn and adds nothing else.
    #[instrument(skip(self, text, options), fields(conversation = %self.id))]
    pub async fn send_and_wait(&self, text: &str, model: Option<&str>, options: SendOptions) -> Result<Completion> {
        self.check_send(text, &options)?;
        let _slot = StreamSlot::acquire(&self.streaming)?;

        let model = self.settings.model_or_default(model).to_string();
        let (_, context) = self.begin_turn(text, &model, &options).await?;
        let request = self.build_request(&model, &context, options);

        let api = ApiClient::new(LlmHttpClient::default(), &self.settings.base_url, self.credentials.clone());
        let completion = match complete(&api, request).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(conversation = %self.id, error = %e, "Completion failed");
                return Err(e);
            }
        };

        let mut store = self.store.lock().await;
        store.append(Role::Assistant, completion.content.as_str(), Utc::now(), None)?;
        if let Err(e) = store.save(&self.id).await {
            warn!(conversation = %self.id, error = %e, "Failed to save conversation");
        }
        info!(conversation = %self.id, chars = completion.content.len(), "Reply complete");
        Ok(completion)
    }

    fn check_send(&self, text: &str, options: &SendOptions) -> Result<()> {
        if text.trim().is_empty() && options.attachment.is_none() {
            return Err(ChatError::InvalidInput("message is empty".into()));
        }
        if !self.credentials.is_configured() {
            return Err(ChatError::MissingCredentials);
        }
        Ok(())
    }

    /// Record the user turn, then the attached file's content. Returns the
    /// pre-send history length and the context window for `model`.
    async fn begin_turn(&self, text: &str, model: &str, options: &SendOptions) -> Result<(usize, Vec<Message>)> {
        let limit = self.settings.model_limits.context_limit_for(model);
        let rollback_len = {
            let mut store = self.store.lock().await;
            let rollback_len = store.len();
            if store.is_empty()
                && let Some(prompt) = options.system_prompt.as_deref().filter(|p| !p.trim().is_empty())
            {
                store.append(Role::System, prompt, Utc::now(), None)?;
            }

            let content = match &options.attachment {
                Some(file) => annotate(text, file),
                None => text.to_string(),
            };
            if let Err(e) = store.append(Role::User, content, Utc::now(), options.attachment.clone()) {
                store.rollback_to(rollback_len);
                return Err(e);
            }
            rollback_len
        };

        // The user turn is visible while the attachment is fetched
        let file_context = match &options.attachment {
            Some(file) => self.file_context(file).await,
            None => None,
        };

        let mut store = self.store.lock().await;
        if let Some(file_context) = file_context
            && let Err(e) = store.append(Role::User, file_context, Utc::now(), None)
        {
            store.rollback_to(rollback_len);
            return Err(e);
        }
        debug!(limit, "Context window");
        Ok((rollback_len, store.truncate_for_context(limit)))
    }

    fn build_request(&self, model: &str, context: &[Message], options: SendOptions) -> ChatRequest {
        ChatRequest::new(model, context)
            .with_temperature(options.temperature.unwrap_or(self.settings.temperature))
            .with_max_tokens(options.max_tokens.unwrap_or(self.settings.max_tokens))
            .with_tools(options.tools)
    }

    /// Fetch attached file text; failures degrade to the annotation only
    async fn file_context(&self, file: &FileRef) -> Option<String> {
        let files = self.files.as_ref()?;
        match files.retrieve_file_content(&file.id).await {
            Ok(content) => Some(format!("File content:\n{}", content)),
            Err(e) => {
                warn!(file_id = %file.id, error = %e, "Could not retrieve attached file content");
                None
            }
        }
    }
}

fn annotate(text: &str, file: &FileRef) -> String {
    let note = format!("[Attached file: {}]", file.name);
    if text.trim().is_empty() {
        note
    } else {
        format!("{}\n\n{}", text, note)
    }
}

/// Everything the background task needs for one request/response exchange
struct Exchange {
    conversation_id: String,
    store: Arc<Mutex<MessageStore>>,
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    endpoint: String,
    body: Value,
    rollback_len: usize,
    tx: mpsc::Sender<ChatEvent>,
    token: CancellationToken,
}

impl Exchange {
    /// The stream slot is released before the terminal event goes out, so a
    /// caller reacting to it can send again right away.
    async fn run(self, slot: StreamSlot) -> StreamOutcome {
        let (outcome, terminal) = self.stream().await;
        {
            let mut store = self.store.lock().await;
            match &outcome {
                StreamOutcome::Cancelled => {
                    store.rollback_to(self.rollback_len);
                    info!(conversation = %self.conversation_id, "Reply cancelled; exchange rolled back");
                }
                StreamOutcome::Failed { reason } => {
                    store.abandon_in_flight();
                    warn!(conversation = %self.conversation_id, reason = %reason, "Reply failed");
                }
                StreamOutcome::Completed { .. } => {}
            }
        }
        drop(slot);

        if let Some(event) = terminal {
            self.deliver(event).await;
        }
        outcome
    }

    /// Drive the body to its end. Returns the outcome and the terminal event
    /// still to be delivered (none when cancelled).
    async fn stream(&self) -> (StreamOutcome, Option<ChatEvent>) {
        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return (StreamOutcome::Cancelled, None),
            opened = self.transport.open(&self.endpoint, self.body.clone(), &self.credentials) => opened,
        };
        let bytes = match opened {
            Ok(bytes) => bytes,
            Err(e) => return failed(e.reason()),
        };

        let mut events = Box::pin(chat_events(bytes));
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return (StreamOutcome::Cancelled, None),
                next = events.next() => next,
            };
            let Some(event) = next else {
                return failed("stream ended without a result".to_string());
            };

            if let Some(outcome) = self.apply(&event).await {
                return (outcome, Some(event));
            }
            if !self.deliver(event).await {
                return (StreamOutcome::Cancelled, None);
            }
        }
    }

    /// Send to the caller unless cancellation comes first
    async fn deliver(&self, event: ChatEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(event) => {
                // A dropped receiver means the caller detached; keep going
                let _ = sent;
                true
            }
        }
    }

    /// Mirror one event into the store; returns the outcome for terminal events
    async fn apply(&self, event: &ChatEvent) -> Option<StreamOutcome> {
        match event {
            ChatEvent::Data { accumulated, .. } => {
                let mut store = self.store.lock().await;
                if !store.is_in_flight()
                    && let Err(e) = store.begin_in_flight(Utc::now())
                {
                    warn!(error = %e, "Could not open in-flight reply");
                }
                store.mutate_tail(accumulated.as_str());
                None
            }
            ChatEvent::Complete { final_text } => {
                let mut store = self.store.lock().await;
                store.finish_in_flight(final_text.as_str());
                if let Err(e) = store.save(&self.conversation_id).await {
                    warn!(conversation = %self.conversation_id, error = %e, "Failed to save conversation");
                }
                info!(conversation = %self.conversation_id, chars = final_text.len(), "Reply complete");
                Some(StreamOutcome::Completed {
                    final_text: final_text.clone(),
                })
            }
            ChatEvent::Error { reason } => Some(StreamOutcome::Failed {
                reason: reason.clone(),
            }),
            ChatEvent::Status { .. } => None,
        }
    }
}

fn failed(reason: String) -> (StreamOutcome, Option<ChatEvent>) {
    (
        StreamOutcome::Failed {
            reason: reason.clone(),
        },
        Some(ChatEvent::Error { reason }),
    )
}
