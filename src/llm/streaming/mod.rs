// src/llm/streaming/mod.rs
// Byte stream -> chat events: frame parser, decoder and reconciler wired together

mod decode;
mod frame;
mod handle;
mod reconciler;

pub use decode::{Decoded, RawEvent, StreamEvent, classify, decode_frame};
pub use frame::EventFrameParser;
pub use handle::{EVENT_CHANNEL_CAPACITY, StreamHandle, StreamOutcome, spawn_forwarding};
pub use reconciler::{DeltaReconciler, ReconcilerState};

use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use std::collections::VecDeque;

use super::transport::ByteStream;

/// What a caller observes while a reply streams in.
///
/// Every stream ends with exactly one `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Run / message lifecycle notification
    Status { phase: String, run_id: Option<String> },
    /// New text plus everything received so far
    Data { delta: String, accumulated: String },
    Complete { final_text: String },
    Error { reason: String },
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Text of the reply once finished
    pub fn final_text(&self) -> Option<&str> {
        match self {
            Self::Complete { final_text } => Some(final_text),
            _ => None,
        }
    }
}

struct DriveState {
    bytes: ByteStream,
    parser: EventFrameParser,
    reconciler: DeltaReconciler,
    queue: VecDeque<ChatEvent>,
    done: bool,
}

impl DriveState {
    fn process(&mut self, frame: &str) {
        let decoded = match decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.reconciler.malformed(e.reason());
                return;
            }
        };
        self.reconciler.frame_ok();
        match decoded {
            Decoded::Frame(raw) => {
                for event in classify(&raw) {
                    self.queue.extend(self.reconciler.handle(event));
                }
            }
            Decoded::Terminator => {
                self.queue.extend(self.reconciler.handle(StreamEvent::Terminator));
            }
            Decoded::Skip => {}
        }
    }
}

/// Turn a response body into chat events.
///
/// The returned stream ends right after its terminal event and stops
/// reading the body at that point. Dropping it drops the body, which is how
/// cancellation reaches the network.
pub fn chat_events(bytes: ByteStream) -> impl Stream<Item = ChatEvent> + Send {
    let mut reconciler = DeltaReconciler::new();
    reconciler.begin();
    let state = DriveState {
        bytes,
        parser: EventFrameParser::new(),
        reconciler,
        queue: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((event, state));
            }
            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.parser.feed(&chunk) {
                        state.process(&frame);
                    }
                }
                Some(Err(e)) => {
                    let event = state.reconciler.abort(e.reason());
                    state.queue.extend(event);
                }
                None => {
                    for frame in state.parser.flush() {
                        state.process(&frame);
                    }
                    let event = state.reconciler.finish();
                    state.queue.extend(event);
                }
            }

            if state.reconciler.is_terminal() {
                state.done = true;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChatError, Result};
    use bytes::Bytes;

    fn body(chunks: Vec<Result<&'static str>>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(|s| Bytes::from_static(s.as_bytes()))),
        ))
    }

    async fn collect(chunks: Vec<Result<&'static str>>) -> Vec<ChatEvent> {
        chat_events(body(chunks)).collect().await
    }

    #[tokio::test]
    async fn test_chat_completion_stream() {
        let events = collect(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n"),
            Ok("data: [DONE]\n\n"),
        ])
        .await;

        assert_eq!(
            events,
            vec![
                ChatEvent::Data { delta: "Hel".into(), accumulated: "Hel".into() },
                ChatEvent::Data { delta: "lo".into(), accumulated: "Hello".into() },
                ChatEvent::Data { delta: "!".into(), accumulated: "Hello!".into() },
                ChatEvent::Complete { final_text: "Hello!".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_middle_frame_skipped() {
        let events = collect(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n"),
            Ok("data: {\"choices\":[{\"del\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"B\"}}]}\n\ndata: [DONE]\n\n"),
        ])
        .await;
        assert_eq!(events.last(), Some(&ChatEvent::Complete { final_text: "AB".into() }));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_followed_by_eventless_frames_is_skipped() {
        let events = collect(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n"),
            Ok("data: {\"choices\":[{\"del\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n"),
            Ok("data: {\"choices\":[],\"usage\":{\"total_tokens\":5}}\n\n"),
        ])
        .await;
        assert_eq!(
            events,
            vec![
                ChatEvent::Data { delta: "A".into(), accumulated: "A".into() },
                ChatEvent::Complete { final_text: "A".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_same_text_for_every_split_point() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo été\"}}]}\n\n",
            "data: [DONE]\n\n",
        )
        .as_bytes();

        for split in 0..=raw.len() {
            let (head, tail) = raw.split_at(split);
            let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::copy_from_slice(head)), Ok(Bytes::copy_from_slice(tail))];
            let events: Vec<ChatEvent> = chat_events(Box::pin(stream::iter(chunks))).collect().await;
            assert_eq!(
                events.last(),
                Some(&ChatEvent::Complete { final_text: "Hello été".into() }),
                "split at {split}"
            );
        }

        // One byte per chunk
        let chunks: Vec<Result<Bytes>> = raw.iter().map(|b| Ok(Bytes::copy_from_slice(&[*b]))).collect();
        let events: Vec<ChatEvent> = chat_events(Box::pin(stream::iter(chunks))).collect().await;
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Data { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo été"]);
    }

    #[tokio::test]
    async fn test_malformed_last_frame_fails() {
        let events = collect(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n"),
            Ok("data: {\"choices\":"),
        ])
        .await;
        match events.last() {
            Some(ChatEvent::Error { reason }) => assert!(reason.contains("malformed frame")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream() {
        let events = collect(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n"),
            Err(ChatError::Transport("connection reset".into())),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"B\"}}]}\n\n"),
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], ChatEvent::Error { reason: "connection reset".into() });
    }

    #[tokio::test]
    async fn test_stops_after_terminal_frame() {
        let events = collect(vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"A\"},\"finish_reason\":\"stop\"}]}\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n"),
        ])
        .await;
        assert_eq!(events.last(), Some(&ChatEvent::Complete { final_text: "A".into() }));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_assistant_run_stream() {
        let events = collect(vec![
            Ok("event: thread.run.created\ndata: {\"id\":\"run_1\"}\n\n"),
            Ok("event: thread.message.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"Oi\"}}]}}\n\n"),
            Ok("event: thread.run.failed\ndata: {\"id\":\"run_1\",\"last_error\":{\"message\":\"Rate limit\"}}\n\n"),
        ])
        .await;
        assert_eq!(
            events,
            vec![
                ChatEvent::Status { phase: "created".into(), run_id: Some("run_1".into()) },
                ChatEvent::Data { delta: "Oi".into(), accumulated: "Oi".into() },
                ChatEvent::Error { reason: "Rate limit".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_body_completes_empty() {
        let events = collect(vec![]).await;
        assert_eq!(events, vec![ChatEvent::Complete { final_text: String::new() }]);
    }
}
