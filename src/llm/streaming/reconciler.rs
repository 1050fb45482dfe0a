// src/llm/streaming/reconciler.rs
// Folds normalized stream events into caller-visible chat events

use tracing::{debug, warn};

use super::ChatEvent;
use super::decode::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    AwaitingFirstToken,
    Streaming,
    Completed,
    Failed,
}

impl ReconcilerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Stream state machine.
///
/// `Idle -> AwaitingFirstToken -> Streaming -> Completed | Failed`. Terminal
/// states absorb everything after them, so at most one `Complete` or `Error`
/// is ever produced.
///
/// A frame that failed to decode is held as pending. If another frame follows
/// it was noise and is dropped with a warning; if the stream ends with it
/// still pending it was the terminal frame and the stream fails.
#[derive(Debug)]
pub struct DeltaReconciler {
    state: ReconcilerState,
    accumulated: String,
    pending_malformed: Option<String>,
    run_id: Option<String>,
}

impl Default for DeltaReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaReconciler {
    pub fn new() -> Self {
        Self {
            state: ReconcilerState::Idle,
            accumulated: String::new(),
            pending_malformed: None,
            run_id: None,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Last run id reported by a status update
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Request sent; waiting for the first frame
    pub fn begin(&mut self) {
        if self.state == ReconcilerState::Idle {
            self.state = ReconcilerState::AwaitingFirstToken;
        }
    }

    /// Apply one decoded event
    pub fn handle(&mut self, event: StreamEvent) -> Option<ChatEvent> {
        if self.is_terminal() {
            debug!(?event, "Ignoring event after terminal state");
            return None;
        }
        self.begin();
        self.frame_ok();

        match event {
            StreamEvent::TextDelta { text } => {
                self.state = ReconcilerState::Streaming;
                self.accumulated.push_str(&text);
                Some(ChatEvent::Data {
                    delta: text,
                    accumulated: self.accumulated.clone(),
                })
            }
            StreamEvent::StatusUpdate { phase, run_id } => {
                if run_id.is_some() {
                    self.run_id.clone_from(&run_id);
                }
                Some(ChatEvent::Status { phase, run_id })
            }
            StreamEvent::Completed { final_text } => {
                let text = if self.accumulated.is_empty() {
                    final_text.unwrap_or_default()
                } else {
                    self.accumulated.clone()
                };
                Some(self.complete(text))
            }
            StreamEvent::Terminator => {
                let text = self.accumulated.clone();
                Some(self.complete(text))
            }
            StreamEvent::Failed { reason } => Some(self.fail(reason)),
        }
    }

    /// A frame decoded fine, whether or not it produced events. Any pending
    /// malformed frame was not the last one and is dropped.
    pub fn frame_ok(&mut self) {
        if let Some(reason) = self.pending_malformed.take() {
            warn!(reason = %reason, "Discarding malformed frame");
        }
    }

    /// Record a frame that failed to decode
    pub fn malformed(&mut self, reason: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let reason = reason.into();
        if let Some(previous) = self.pending_malformed.replace(reason) {
            warn!(reason = %previous, "Discarding malformed frame");
        }
    }

    /// The byte stream ended cleanly
    pub fn finish(&mut self) -> Option<ChatEvent> {
        if self.is_terminal() {
            return None;
        }
        if let Some(reason) = self.pending_malformed.take() {
            return Some(self.fail(reason));
        }
        debug!("Stream ended without a terminal frame; completing");
        let text = self.accumulated.clone();
        Some(self.complete(text))
    }

    /// The transport failed mid-stream
    pub fn abort(&mut self, reason: impl Into<String>) -> Option<ChatEvent> {
        if self.is_terminal() {
            return None;
        }
        self.pending_malformed = None;
        Some(self.fail(reason.into()))
    }

    fn complete(&mut self, final_text: String) -> ChatEvent {
        self.state = ReconcilerState::Completed;
        ChatEvent::Complete { final_text }
    }

    fn fail(&mut self, reason: String) -> ChatEvent {
        self.state = ReconcilerState::Failed;
        ChatEvent::Error { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::TextDelta { text: text.into() }
    }

    fn accumulations(events: &[ChatEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Data { accumulated, .. } => Some(accumulated.clone()),
                _ => None,
            })
            .collect()
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    #[test]
    fn test_state_progression() {
        let mut r = DeltaReconciler::new();
        assert_eq!(r.state(), ReconcilerState::Idle);
        r.begin();
        assert_eq!(r.state(), ReconcilerState::AwaitingFirstToken);
        r.handle(delta("a"));
        assert_eq!(r.state(), ReconcilerState::Streaming);
        r.handle(StreamEvent::Completed { final_text: None });
        assert_eq!(r.state(), ReconcilerState::Completed);
    }

    #[test]
    fn test_status_does_not_leave_awaiting() {
        let mut r = DeltaReconciler::new();
        r.begin();
        let ev = r.handle(StreamEvent::StatusUpdate {
            phase: "queued".into(),
            run_id: Some("run_1".into()),
        });
        assert_eq!(
            ev,
            Some(ChatEvent::Status {
                phase: "queued".into(),
                run_id: Some("run_1".into())
            })
        );
        assert_eq!(r.state(), ReconcilerState::AwaitingFirstToken);
        assert_eq!(r.run_id(), Some("run_1"));
    }

    // ========================================================================
    // Accumulation
    // ========================================================================

    #[test]
    fn test_simple_completion() {
        let mut r = DeltaReconciler::new();
        r.begin();
        let mut events: Vec<ChatEvent> = ["Hel", "lo", "!"]
            .into_iter()
            .filter_map(|t| r.handle(delta(t)))
            .collect();
        events.extend(r.handle(StreamEvent::Terminator));

        assert_eq!(accumulations(&events), vec!["Hel", "Hello", "Hello!"]);
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Complete {
                final_text: "Hello!".into()
            })
        );
    }

    #[test]
    fn test_accumulated_is_prefix_of_final() {
        let mut r = DeltaReconciler::new();
        r.begin();
        let mut events: Vec<ChatEvent> = ["a", "bc", "", "def"]
            .into_iter()
            .filter_map(|t| r.handle(delta(t)))
            .collect();
        events.extend(r.finish());

        let Some(ChatEvent::Complete { final_text }) = events.last() else {
            panic!("expected completion");
        };
        let acc = accumulations(&events);
        for pair in acc.windows(2) {
            assert!(pair[1].starts_with(&pair[0]));
        }
        for a in &acc {
            assert!(final_text.starts_with(a.as_str()));
        }
        assert_eq!(final_text, "abcdef");
    }

    #[test]
    fn test_completed_payload_used_when_nothing_streamed() {
        let mut r = DeltaReconciler::new();
        r.begin();
        let ev = r.handle(StreamEvent::Completed {
            final_text: Some("whole".into()),
        });
        assert_eq!(ev, Some(ChatEvent::Complete { final_text: "whole".into() }));
    }

    #[test]
    fn test_accumulated_text_wins_over_payload() {
        let mut r = DeltaReconciler::new();
        r.begin();
        r.handle(delta("streamed"));
        let ev = r.handle(StreamEvent::Completed {
            final_text: Some("other".into()),
        });
        assert_eq!(ev, Some(ChatEvent::Complete { final_text: "streamed".into() }));
    }

    // ========================================================================
    // Terminal states
    // ========================================================================

    #[test]
    fn test_single_terminal_event() {
        let mut r = DeltaReconciler::new();
        r.begin();
        r.handle(delta("x"));
        assert!(r.handle(StreamEvent::Completed { final_text: None }).is_some());
        assert!(r.handle(StreamEvent::Terminator).is_none());
        assert!(r.handle(delta("late")).is_none());
        assert!(r.handle(StreamEvent::Failed { reason: "x".into() }).is_none());
        assert!(r.finish().is_none());
        assert!(r.abort("gone").is_none());
        assert_eq!(r.accumulated(), "x");
    }

    #[test]
    fn test_failure_reason_passes_through() {
        let mut r = DeltaReconciler::new();
        r.begin();
        r.handle(delta("part"));
        let ev = r.handle(StreamEvent::Failed {
            reason: "Rate limit".into(),
        });
        assert_eq!(ev, Some(ChatEvent::Error { reason: "Rate limit".into() }));
        assert_eq!(r.state(), ReconcilerState::Failed);
    }

    #[test]
    fn test_finish_without_terminal_synthesizes_completion() {
        let mut r = DeltaReconciler::new();
        r.begin();
        assert_eq!(r.finish(), Some(ChatEvent::Complete { final_text: String::new() }));
    }

    #[test]
    fn test_abort_fails() {
        let mut r = DeltaReconciler::new();
        r.begin();
        r.handle(delta("half"));
        assert_eq!(
            r.abort("connection reset"),
            Some(ChatEvent::Error { reason: "connection reset".into() })
        );
    }

    // ========================================================================
    // Malformed frames
    // ========================================================================

    #[test]
    fn test_malformed_then_valid_frame_is_skipped() {
        let mut r = DeltaReconciler::new();
        r.begin();
        r.handle(delta("A"));
        r.malformed("malformed frame");
        r.handle(delta("B"));
        assert_eq!(
            r.handle(StreamEvent::Terminator),
            Some(ChatEvent::Complete { final_text: "AB".into() })
        );
    }

    #[test]
    fn test_malformed_terminal_frame_fails() {
        let mut r = DeltaReconciler::new();
        r.begin();
        r.handle(delta("A"));
        r.malformed("malformed frame: {\"choices\":");
        assert_eq!(
            r.finish(),
            Some(ChatEvent::Error {
                reason: "malformed frame: {\"choices\":".into()
            })
        );
    }

    #[test]
    fn test_malformed_then_eventless_frame_completes() {
        let mut r = DeltaReconciler::new();
        r.begin();
        r.handle(delta("A"));
        r.malformed("malformed frame");
        r.frame_ok();
        assert_eq!(r.finish(), Some(ChatEvent::Complete { final_text: "A".into() }));
    }
}
