// src/llm/streaming/handle.rs
// Caller-side handle to a streaming reply running in a background task

use futures::{Stream, StreamExt, stream};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChatEvent, chat_events};
use crate::error::{ChatError, Result};
use crate::llm::transport::ByteStream;

/// Buffered events between the stream task and the caller
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How a stream task ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed { final_text: String },
    Failed { reason: String },
    Cancelled,
}

impl StreamOutcome {
    pub(crate) fn from_terminal(event: &ChatEvent) -> Option<Self> {
        match event {
            ChatEvent::Complete { final_text } => Some(Self::Completed {
                final_text: final_text.clone(),
            }),
            ChatEvent::Error { reason } => Some(Self::Failed {
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// Events of one in-progress reply plus the means to stop it.
///
/// Dropping the handle detaches: the task runs to completion and the reply
/// is still recorded. After a successful `cancel()` no further `Data` or
/// `Complete` events are delivered and the last event is
/// `Error { reason: "cancelled" }`.
#[derive(Debug)]
pub struct StreamHandle {
    events: mpsc::Receiver<ChatEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<StreamOutcome>>,
    outcome: Option<StreamOutcome>,
    cancelled: bool,
    terminal_seen: bool,
}

impl StreamHandle {
    pub fn new(
        events: mpsc::Receiver<ChatEvent>,
        cancel: CancellationToken,
        task: JoinHandle<StreamOutcome>,
    ) -> Self {
        Self {
            events,
            cancel,
            task: Some(task),
            outcome: None,
            cancelled: false,
            terminal_seen: false,
        }
    }

    /// Next event; `None` once the terminal event has been delivered
    pub async fn next(&mut self) -> Option<ChatEvent> {
        if self.terminal_seen {
            return None;
        }
        if self.cancelled {
            self.events.close();
            self.terminal_seen = true;
            return Some(ChatEvent::Error {
                reason: ChatError::Cancelled.reason(),
            });
        }

        match self.events.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.terminal_seen = true;
                }
                Some(event)
            }
            None => {
                // Task ended without a terminal event reaching us
                self.terminal_seen = true;
                match self.join().await {
                    StreamOutcome::Completed { final_text } => Some(ChatEvent::Complete { final_text }),
                    StreamOutcome::Failed { reason } => Some(ChatEvent::Error { reason }),
                    StreamOutcome::Cancelled => Some(ChatEvent::Error {
                        reason: ChatError::Cancelled.reason(),
                    }),
                }
            }
        }
    }

    /// Stop the stream. Returns true if it ended cancelled, false if it had
    /// already completed or failed.
    pub async fn cancel(&mut self) -> bool {
        self.cancel.cancel();
        let cancelled = self.join().await == StreamOutcome::Cancelled;
        if cancelled && !self.terminal_seen {
            self.cancelled = true;
        }
        debug!(cancelled, "Stream cancel requested");
        cancelled
    }

    /// True once the task has ended (the outcome is known)
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Drain remaining events and return how the stream ended
    pub async fn finished(mut self) -> StreamOutcome {
        while self.next().await.is_some() {}
        self.join().await
    }

    /// Adapt to a `Stream` of events
    pub fn into_stream(self) -> impl Stream<Item = ChatEvent> + Send {
        stream::unfold(self, |mut handle| async move {
            handle.next().await.map(|event| (event, handle))
        })
    }

    async fn join(&mut self) -> StreamOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| StreamOutcome::Failed {
                reason: ChatError::from(e).reason(),
            }),
            None => StreamOutcome::Cancelled,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Spawn a task that opens a body, forwards its chat events to a channel
/// and stops on cancellation. `observe` sees every event before delivery.
pub fn spawn_forwarding<O, F>(open: O, mut observe: F) -> StreamHandle
where
    O: Future<Output = Result<ByteStream>> + Send + 'static,
    F: FnMut(&ChatEvent) + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let token = CancellationToken::new();
    let task_token = token.clone();

    let task = tokio::spawn(async move {
        let opened = tokio::select! {
            biased;
            _ = task_token.cancelled() => return StreamOutcome::Cancelled,
            opened = open => opened,
        };
        let bytes = match opened {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = e.reason();
                let _ = tx.send(ChatEvent::Error { reason: reason.clone() }).await;
                return StreamOutcome::Failed { reason };
            }
        };

        let mut events = Box::pin(chat_events(bytes));
        loop {
            let next = tokio::select! {
                biased;
                _ = task_token.cancelled() => return StreamOutcome::Cancelled,
                next = events.next() => next,
            };
            let Some(event) = next else {
                return StreamOutcome::Failed {
                    reason: "stream ended without a result".to_string(),
                };
            };
            observe(&event);
            let outcome = StreamOutcome::from_terminal(&event);
            tokio::select! {
                biased;
                _ = task_token.cancelled() => return StreamOutcome::Cancelled,
                _ = tx.send(event) => {}
            }
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    });

    StreamHandle::new(rx, token, task)
}
