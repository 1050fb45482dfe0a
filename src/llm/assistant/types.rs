// src/llm/assistant/types.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Deserialize, Debug, Clone)]
pub struct Thread {
    pub id: String,
    #[serde(default)]
    pub created_at: i64,
}

/// `{ id, deleted }` returned by DELETE endpoints
#[derive(Deserialize, Debug, Clone)]
pub struct Deleted {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

/// One part of a message body sent to a thread
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: &'static str,
    pub text: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text",
            text: text.into(),
        }
    }
}

/// Request to create a message in a thread
#[derive(Serialize, Debug)]
pub struct CreateMessageRequest {
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

/// Message as returned by the thread endpoints
#[derive(Deserialize, Debug, Clone)]
pub struct ThreadMessage {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Vec<MessageContent>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl ThreadMessage {
    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_ref())
            .map(|t| t.value.as_str())
            .collect()
    }
}

/// Content within a message
#[derive(Deserialize, Debug, Clone)]
pub struct MessageContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<TextContent>,
}

/// Text content details
#[derive(Deserialize, Debug, Clone)]
pub struct TextContent {
    pub value: String,
    #[serde(default)]
    pub annotations: Vec<Value>,
}

/// Request to create a run
#[derive(Serialize, Debug)]
pub struct CreateRunRequest {
    pub assistant_id: String,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub thread_id: String,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RunError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Run status values
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
}

impl RunStatus {
    /// Wire name, e.g. `in_progress`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Completed | Self::Incomplete | Self::Expired
        )
    }
}

/// List endpoints wrap results in `data`
#[derive(Deserialize, Debug)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Assistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

/// Request to create or update an assistant. Tools are given by type name
/// (`"file_search"`, `"code_interpreter"`).
#[derive(Serialize, Debug, Clone, Default)]
pub struct CreateAssistantRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub model: String,
    #[serde(serialize_with = "serialize_tool_types")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
}

/// A file referenced by an assistant's `file_ids`
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantFile {
    pub id: String,
    pub assistant_id: String,
}

fn serialize_tool_types<S>(tools: &[String], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeSeq;
    let mut seq = serializer.serialize_seq(Some(tools.len()))?;
    for tool in tools {
        seq.serialize_element(&serde_json::json!({ "type": tool }))?;
    }
    seq.end()
}

/// Tool resources for assistants
#[derive(Serialize, Debug)]
pub struct ToolResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_search: Option<FileSearchResource>,
}

/// File search resource configuration
#[derive(Serialize, Debug)]
pub struct FileSearchResource {
    pub vector_store_ids: Vec<String>,
}
