// src/llm/streaming/decode.rs
// Frame decoding and event classification across wire families

use serde_json::Value;
use tracing::debug;

use crate::error::{ChatError, Result};

/// Literal end-of-stream sentinel carried in a data line
pub const DONE_MARKER: &str = "[DONE]";

/// Normalized event the reconciler consumes
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta { text: String },
    Completed { final_text: Option<String> },
    Failed { reason: String },
    StatusUpdate { phase: String, run_id: Option<String> },
    Terminator,
}

/// A decoded frame before classification
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// `event:` name for typed frames
    pub event: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(RawEvent),
    Terminator,
    /// Nothing to act on (empty data line)
    Skip,
}

/// A matcher either claims the frame (`Some`) or passes it on (`None`)
type Matcher = fn(&str) -> Option<Result<Decoded>>;

/// Tried in order; first claimant wins
const MATCHERS: &[(&str, Matcher)] = &[
    ("typed", match_typed),
    ("untyped", match_untyped),
    ("bare_json", match_bare_json),
];

/// Decode one frame from the parser
pub fn decode_frame(frame: &str) -> Result<Decoded> {
    let trimmed = frame.trim();
    if trimmed.is_empty() {
        return Ok(Decoded::Skip);
    }
    for (name, matcher) in MATCHERS {
        if let Some(result) = matcher(trimmed) {
            debug!(matcher = name, "Frame matched");
            return result;
        }
    }
    Err(ChatError::Protocol(format!(
        "unrecognized frame: {}",
        preview(trimmed)
    )))
}

fn match_typed(frame: &str) -> Option<Result<Decoded>> {
    let mut lines = frame.lines();
    let event = lines.next()?.strip_prefix("event:")?.trim().to_string();

    let payload = lines
        .filter_map(|l| l.strip_prefix("data:"))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");

    if payload == DONE_MARKER {
        return Some(Ok(Decoded::Terminator));
    }
    if payload.is_empty() {
        return Some(Ok(Decoded::Frame(RawEvent {
            event: Some(event),
            data: Value::Null,
        })));
    }
    Some(parse_json(&payload).map(|data| {
        Decoded::Frame(RawEvent {
            event: Some(event),
            data,
        })
    }))
}

fn match_untyped(frame: &str) -> Option<Result<Decoded>> {
    let payload = frame.strip_prefix("data:")?.trim();
    if payload == DONE_MARKER {
        return Some(Ok(Decoded::Terminator));
    }
    if payload.is_empty() {
        return Some(Ok(Decoded::Skip));
    }
    Some(parse_json(payload).map(|data| Decoded::Frame(RawEvent { event: None, data })))
}

fn match_bare_json(frame: &str) -> Option<Result<Decoded>> {
    if frame == DONE_MARKER {
        return Some(Ok(Decoded::Terminator));
    }
    if !frame.starts_with('{') && !frame.starts_with('[') {
        return None;
    }
    Some(parse_json(frame).map(|data| Decoded::Frame(RawEvent { event: None, data })))
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text)
        .map_err(|e| ChatError::Protocol(format!("malformed frame ({}): {}", e, preview(text))))
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(MAX).collect::<String>())
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Map a decoded frame to zero or more normalized events.
///
/// Unknown event types yield nothing.
pub fn classify(raw: &RawEvent) -> Vec<StreamEvent> {
    // Untyped assistant frames arrive wrapped as {"type": ..., "data": {...}}
    let (kind, payload) = match (&raw.event, raw.data.get("type").and_then(Value::as_str)) {
        (Some(event), _) => (Some(event.as_str()), &raw.data),
        (None, Some(kind)) if kind.starts_with("thread.") && raw.data.get("data").is_some() => {
            (Some(kind), &raw.data["data"])
        }
        (None, Some(kind)) => (Some(kind), &raw.data),
        (None, None) => (raw.data.get("object").and_then(Value::as_str), &raw.data),
    };

    match kind {
        Some(kind) if kind.starts_with("thread.") => classify_assistant(kind, payload),
        Some(kind) if kind.starts_with("response.") => classify_responses(kind, payload),
        Some("error") => vec![StreamEvent::Failed {
            reason: error_reason(payload),
        }],
        Some("done") => vec![StreamEvent::Terminator],
        _ if payload.get("choices").is_some() || payload.get("error").is_some() => {
            classify_chat_chunk(payload)
        }
        other => {
            debug!(kind = ?other, "Ignoring unrecognized event");
            Vec::new()
        }
    }
}

/// `chat.completion.chunk` family
fn classify_chat_chunk(payload: &Value) -> Vec<StreamEvent> {
    if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
        return vec![StreamEvent::Failed {
            reason: error_reason(err),
        }];
    }

    let mut events = Vec::new();
    let Some(choice) = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        // Usage-only chunk
        return events;
    };

    if let Some(text) = choice
        .pointer("/delta/content")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
    {
        events.push(StreamEvent::TextDelta {
            text: text.to_string(),
        });
    }
    if choice
        .get("finish_reason")
        .is_some_and(|r| !r.is_null())
    {
        events.push(StreamEvent::Completed { final_text: None });
    }
    events
}

/// `thread.*` family from assistant runs
fn classify_assistant(kind: &str, payload: &Value) -> Vec<StreamEvent> {
    let string_at = |pointer: &str| payload.pointer(pointer).and_then(Value::as_str).map(String::from);

    let event = match kind {
        "thread.run.created" | "thread.run.queued" | "thread.run.in_progress"
        | "thread.run.requires_action" => StreamEvent::StatusUpdate {
            phase: kind.trim_start_matches("thread.run.").to_string(),
            run_id: string_at("/id"),
        },
        "thread.message.created" | "thread.message.in_progress" => StreamEvent::StatusUpdate {
            phase: kind.trim_start_matches("thread.").replace('.', "_"),
            run_id: string_at("/run_id"),
        },
        "thread.message.delta" => {
            let text = text_parts(payload.pointer("/delta/content"));
            if text.is_empty() {
                return Vec::new();
            }
            StreamEvent::TextDelta { text }
        }
        "thread.message.completed" => {
            let text = text_parts(payload.get("content"));
            StreamEvent::Completed {
                final_text: (!text.is_empty()).then_some(text),
            }
        }
        "thread.run.completed" => StreamEvent::Completed { final_text: None },
        "thread.run.failed" => StreamEvent::Failed {
            reason: payload
                .get("last_error")
                .filter(|e| !e.is_null())
                .or_else(|| payload.get("error"))
                .map(error_reason)
                .unwrap_or_else(|| "run failed".to_string()),
        },
        "thread.run.cancelled" => StreamEvent::Failed {
            reason: "cancelled".to_string(),
        },
        "thread.run.expired" => StreamEvent::Failed {
            reason: "run expired".to_string(),
        },
        _ => {
            debug!(kind = %kind, "Ignoring assistant event");
            return Vec::new();
        }
    };
    vec![event]
}

/// `response.*` family from the Responses API
fn classify_responses(kind: &str, payload: &Value) -> Vec<StreamEvent> {
    let event = match kind {
        "response.output_text.delta" => match payload.get("delta").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => StreamEvent::TextDelta {
                text: text.to_string(),
            },
            _ => return Vec::new(),
        },
        "response.completed" | "response.done" => StreamEvent::Completed { final_text: None },
        "response.failed" => StreamEvent::Failed {
            reason: payload
                .pointer("/response/error")
                .filter(|e| !e.is_null())
                .map(error_reason)
                .unwrap_or_else(|| "response failed".to_string()),
        },
        "response.created" | "response.in_progress" => StreamEvent::StatusUpdate {
            phase: kind.trim_start_matches("response.").to_string(),
            run_id: payload
                .pointer("/response/id")
                .and_then(Value::as_str)
                .map(String::from),
        },
        _ => return Vec::new(),
    };
    vec![event]
}

/// Concatenate `[{type: "text", text: {value}}]` content parts
fn text_parts(content: Option<&Value>) -> String {
    content
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.pointer("/text/value").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// `message` field of an error object, else the object as text
fn error_reason(err: &Value) -> String {
    err.get("message")
        .and_then(Value::as_str)
        .or_else(|| err.pointer("/error/message").and_then(Value::as_str))
        .or_else(|| err.as_str())
        .map(String::from)
        .unwrap_or_else(|| err.to_string())
}
