// src/llm/assistant/client.rs
// Threads, messages and streamed runs on the assistants endpoints

use reqwest::Method;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::types::{
    Assistant, AssistantFile, ContentPart, CreateAssistantRequest, CreateMessageRequest, CreateRunRequest,
    Deleted, FileSearchResource, ListResponse, Run, RunStatus, Thread, ThreadMessage, ToolResources,
};
use crate::config::{ClientSettings, Credentials};
use crate::error::{ChatError, Result};
use crate::llm::api::{ASSISTANTS_BETA, ApiClient};
use crate::llm::http_client::LlmHttpClient;
use crate::llm::streaming::{ChatEvent, StreamHandle, StreamOutcome, spawn_forwarding};
use crate::llm::transport::{HttpTransport, Transport};

#[derive(Clone)]
pub struct AssistantsClient {
    api: ApiClient,
    transport: Arc<dyn Transport>,
}

impl AssistantsClient {
    /// `api` should carry the assistants beta header, as should any HTTP
    /// transport passed here
    pub fn new(api: ApiClient, transport: Arc<dyn Transport>) -> Self {
        Self { api, transport }
    }

    pub fn from_settings(settings: &ClientSettings, credentials: Credentials) -> Self {
        let http = LlmHttpClient::default();
        let api = ApiClient::new(http.clone(), &settings.base_url, credentials).with_assistants_beta();
        let transport = HttpTransport::new(http).with_header("OpenAI-Beta", ASSISTANTS_BETA);
        Self::new(api, Arc::new(transport))
    }

    // ========================================================================
    // Threads and messages
    // ========================================================================

    pub async fn create_thread(&self) -> Result<Thread> {
        let thread: Thread = self.api.json(Method::POST, "threads", Some(&json!({}))).await?;
        info!(thread_id = %thread.id, "Thread created");
        Ok(thread)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<Deleted> {
        require_id("thread", thread_id)?;
        self.api
            .json(Method::DELETE, &format!("threads/{}", thread_id), None)
            .await
    }

    /// Add a user message. An attached file id is noted as a text part,
    /// since message content only accepts text and images.
    pub async fn add_message(
        &self,
        thread_id: &str,
        text: &str,
        file_id: Option<&str>,
    ) -> Result<ThreadMessage> {
        require_id("thread", thread_id)?;
        let mut content = Vec::new();
        if !text.trim().is_empty() {
            content.push(ContentPart::text(text));
        }
        if let Some(file_id) = file_id {
            content.push(ContentPart::text(format!("File (ID: {}) attached.", file_id)));
        }
        if content.is_empty() {
            return Err(ChatError::InvalidInput("message is empty".into()));
        }

        let body = serde_json::to_value(CreateMessageRequest {
            role: "user",
            content,
        })?;
        self.api
            .json(Method::POST, &format!("threads/{}/messages", thread_id), Some(&body))
            .await
    }

    pub async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        require_id("thread", thread_id)?;
        let list: ListResponse<ThreadMessage> = self
            .api
            .json(Method::GET, &format!("threads/{}/messages", thread_id), None)
            .await?;
        Ok(list.data)
    }

    // ========================================================================
    // Runs
    // ========================================================================

    pub async fn run_status(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        self.api
            .json(Method::GET, &format!("threads/{}/runs/{}", thread_id, run_id), None)
            .await
    }

    pub async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        let run: Run = self
            .api
            .json(
                Method::POST,
                &format!("threads/{}/runs/{}/cancel", thread_id, run_id),
                None,
            )
            .await?;
        info!(thread_id = %thread_id, run_id = %run_id, status = ?run.status, "Run cancel requested");
        Ok(run)
    }

    /// Start a run without streaming. The run comes back as first reported,
    /// usually `queued`.
    pub async fn run_assistant(&self, thread_id: &str, assistant_id: &str) -> Result<Run> {
        require_id("thread", thread_id)?;
        require_id("assistant", assistant_id)?;
        let body = serde_json::to_value(CreateRunRequest {
            assistant_id: assistant_id.to_string(),
            stream: false,
            additional_instructions: None,
        })?;
        let run: Run = self
            .api
            .json(Method::POST, &format!("threads/{}/runs", thread_id), Some(&body))
            .await?;
        info!(thread_id = %thread_id, run_id = %run.id, status = ?run.status, "Run created");
        Ok(run)
    }

    /// Poll the run every `interval` until it reaches a terminal status
    pub async fn wait_for_run(&self, thread_id: &str, run_id: &str, interval: Duration) -> Result<Run> {
        loop {
            let run = self.run_status(thread_id, run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            debug!(run_id = %run_id, status = ?run.status, "Run still active");
            tokio::time::sleep(interval).await;
        }
    }

    /// Run the assistant to completion and return the text of its reply.
    ///
    /// A run ending in any other terminal status fails with
    /// [`ChatError::RunFailed`].
    #[instrument(skip(self))]
    pub async fn run_to_completion(
        &self,
        thread_id: &str,
        assistant_id: &str,
        interval: Duration,
    ) -> Result<String> {
        let run = self.run_assistant(thread_id, assistant_id).await?;
        let run = if run.status.is_terminal() {
            run
        } else {
            self.wait_for_run(thread_id, &run.id, interval).await?
        };
        if run.status != RunStatus::Completed {
            let status = run.status.as_str().to_string();
            let message = run
                .last_error
                .map(|e| e.message)
                .unwrap_or_else(|| format!("run ended with status {}", status));
            return Err(ChatError::RunFailed { status, message });
        }

        // Newest first
        let messages = self.list_messages(thread_id).await?;
        let reply = messages
            .iter()
            .find(|m| m.role == "assistant" && m.run_id.as_deref() == Some(run.id.as_str()))
            .or_else(|| messages.iter().find(|m| m.role == "assistant"))
            .map(ThreadMessage::text)
            .unwrap_or_default();
        Ok(reply)
    }

    /// Start a run and stream its events
    #[instrument(skip(self))]
    pub async fn stream_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunHandle> {
        require_id("thread", thread_id)?;
        require_id("assistant", assistant_id)?;
        let credentials = self.api.credentials().clone();
        if !credentials.is_configured() {
            return Err(ChatError::MissingCredentials);
        }

        let body = serde_json::to_value(CreateRunRequest {
            assistant_id: assistant_id.to_string(),
            stream: true,
            additional_instructions: None,
        })?;
        let url = self.api.url(&format!("threads/{}/runs", thread_id));
        let transport = self.transport.clone();

        let (run_tx, run_rx) = watch::channel(None);
        let inner = spawn_forwarding(
            async move { transport.open(&url, body, &credentials).await },
            move |event| {
                if let ChatEvent::Status {
                    run_id: Some(run_id),
                    ..
                } = event
                {
                    run_tx.send_replace(Some(run_id.clone()));
                }
            },
        );

        Ok(RunHandle {
            inner,
            run_id: run_rx,
            client: self.clone(),
            thread_id: thread_id.to_string(),
        })
    }

    // ========================================================================
    // Assistants
    // ========================================================================

    pub async fn create_assistant(&self, request: &CreateAssistantRequest) -> Result<Assistant> {
        let body = serde_json::to_value(request)?;
        let assistant: Assistant = self.api.json(Method::POST, "assistants", Some(&body)).await?;
        info!(assistant_id = %assistant.id, "Assistant created");
        Ok(assistant)
    }

    pub async fn list_assistants(&self) -> Result<Vec<Assistant>> {
        let list: ListResponse<Assistant> = self.api.json(Method::GET, "assistants", None).await?;
        Ok(list.data)
    }

    pub async fn delete_assistant(&self, assistant_id: &str) -> Result<Deleted> {
        require_id("assistant", assistant_id)?;
        self.api
            .json(Method::DELETE, &format!("assistants/{}", assistant_id), None)
            .await
    }

    pub async fn get_assistant(&self, assistant_id: &str) -> Result<Assistant> {
        require_id("assistant", assistant_id)?;
        self.api
            .json(Method::GET, &format!("assistants/{}", assistant_id), None)
            .await
    }

    /// Replace the assistant's name, instructions, model and tools. File ids
    /// are sent only when the request carries some.
    pub async fn update_assistant(
        &self,
        assistant_id: &str,
        request: &CreateAssistantRequest,
    ) -> Result<Assistant> {
        require_id("assistant", assistant_id)?;
        let body = serde_json::to_value(request)?;
        let assistant: Assistant = self
            .api
            .json(Method::POST, &format!("assistants/{}", assistant_id), Some(&body))
            .await?;
        info!(assistant_id = %assistant.id, "Assistant updated");
        Ok(assistant)
    }

    /// Add `file_id` to the assistant's file list, keeping the files it
    /// already has
    pub async fn attach_file_to_assistant(&self, assistant_id: &str, file_id: &str) -> Result<AssistantFile> {
        require_id("file", file_id)?;
        let current = self.get_assistant(assistant_id).await?;
        let mut file_ids = current.file_ids;
        if !file_ids.iter().any(|id| id == file_id) {
            file_ids.push(file_id.to_string());
        }
        let body = json!({ "file_ids": file_ids });
        let _: Assistant = self
            .api
            .json(Method::POST, &format!("assistants/{}", assistant_id), Some(&body))
            .await?;
        info!(assistant_id = %assistant_id, file_id = %file_id, "File attached to assistant");
        Ok(AssistantFile {
            id: file_id.to_string(),
            assistant_id: assistant_id.to_string(),
        })
    }

    pub async fn list_assistant_files(&self, assistant_id: &str) -> Result<Vec<AssistantFile>> {
        let assistant = self.get_assistant(assistant_id).await?;
        Ok(assistant
            .file_ids
            .into_iter()
            .map(|id| AssistantFile {
                id,
                assistant_id: assistant.id.clone(),
            })
            .collect())
    }

    /// Point the assistant's file search at `vector_store_id`, enabling the
    /// tool if needed and keeping its other settings
    pub async fn link_vector_store(&self, assistant_id: &str, vector_store_id: &str) -> Result<Assistant> {
        let current = self.get_assistant(assistant_id).await?;
        let path = format!("assistants/{}", assistant_id);

        let mut tools = current.tools;
        if !tools.iter().any(|t| t.get("type").and_then(Value::as_str) == Some("file_search")) {
            tools.push(json!({ "type": "file_search" }));
        }
        let body = json!({
            "tools": tools,
            "tool_resources": ToolResources {
                file_search: Some(FileSearchResource {
                    vector_store_ids: vec![vector_store_id.to_string()],
                }),
            },
        });
        self.api.json(Method::POST, &path, Some(&body)).await
    }
}

fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ChatError::InvalidInput(format!("{} id is required", kind)));
    }
    Ok(())
}

/// Streaming run in progress
pub struct RunHandle {
    inner: StreamHandle,
    run_id: watch::Receiver<Option<String>>,
    client: AssistantsClient,
    thread_id: String,
}

impl RunHandle {
    pub async fn next(&mut self) -> Option<ChatEvent> {
        self.inner.next().await
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Run id once the server has reported it
    pub fn run_id(&self) -> Option<String> {
        self.run_id.borrow().clone()
    }

    /// Stop local processing; if a run id was seen, also ask the server to
    /// cancel the run. The remote call is best-effort.
    pub async fn cancel(&mut self) -> bool {
        let cancelled = self.inner.cancel().await;
        if cancelled && let Some(run_id) = self.run_id() {
            if let Err(e) = self.client.cancel_run(&self.thread_id, &run_id).await {
                warn!(run_id = %run_id, error = %e, "Remote run cancel failed");
            }
        }
        cancelled
    }

    pub async fn finished(self) -> StreamOutcome {
        self.inner.finished().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::transport::ByteStream;
    use crate::test_support::{http_response, serve_many, serve_once};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use std::time::Duration;

    /// Yields the given chunks, then either ends or hangs
    struct ScriptedTransport {
        chunks: Vec<&'static str>,
        hang: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, _endpoint: &str, _body: Value, _credentials: &Credentials) -> Result<ByteStream> {
            let chunks: Vec<Result<Bytes>> = self
                .chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect();
            let body = stream::iter(chunks);
            if self.hang {
                Ok(Box::pin(body.chain(stream::pending())))
            } else {
                Ok(Box::pin(body))
            }
        }
    }

    fn client(base: &str, transport: ScriptedTransport) -> AssistantsClient {
        let mut http = LlmHttpClient::new(Duration::from_secs(2));
        http.max_attempts = 0;
        let api = ApiClient::new(http, base, Credentials::new("sk-test")).with_assistants_beta();
        AssistantsClient::new(api, Arc::new(transport))
    }

    #[tokio::test]
    async fn test_stream_run_events() {
        let transport = ScriptedTransport {
            chunks: vec![
                "event: thread.run.created\ndata: {\"id\":\"run_1\",\"object\":\"thread.run\"}\n\n",
                "event: thread.message.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"Ol\"}}]}}\n\n",
                "event: thread.message.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"á\"}}]}}\n\n",
                "event: thread.run.completed\ndata: {\"id\":\"run_1\"}\n\nevent: done\ndata: [DONE]\n\n",
            ],
            hang: false,
        };
        let client = client("http://127.0.0.1:1/v1", transport);
        let mut handle = client.stream_run("thread_1", "asst_1").await.unwrap();

        let mut events = Vec::new();
        while let Some(ev) = handle.next().await {
            events.push(ev);
        }
        assert_eq!(handle.run_id().as_deref(), Some("run_1"));
        assert_eq!(events.len(), 4);
        assert_eq!(events[3], ChatEvent::Complete { final_text: "Olá".into() });
    }

    #[tokio::test]
    async fn test_cancel_issues_remote_cancel() {
        let (base, server) = serve_once(http_response(
            "200 OK",
            "application/json",
            r#"{"id":"run_7","status":"cancelling","thread_id":"thread_1"}"#,
        ))
        .await;
        let transport = ScriptedTransport {
            chunks: vec!["event: thread.run.created\ndata: {\"id\":\"run_7\"}\n\n"],
            hang: true,
        };
        let client = client(&base, transport);
        let mut handle = client.stream_run("thread_1", "asst_1").await.unwrap();

        assert!(matches!(handle.next().await, Some(ChatEvent::Status { .. })));
        assert!(handle.cancel().await);
        assert_eq!(handle.next().await, Some(ChatEvent::Error { reason: "cancelled".into() }));
        assert_eq!(handle.next().await, None);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/threads/thread_1/runs/run_7/cancel"));
    }

    #[tokio::test]
    async fn test_stream_run_requires_ids() {
        let client = client("http://127.0.0.1:1/v1", ScriptedTransport { chunks: vec![], hang: false });
        let err = client.stream_run("", "asst_1").await.err().unwrap();
        assert!(matches!(err, ChatError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_add_message_notes_file() {
        let (base, server) = serve_once(http_response(
            "200 OK",
            "application/json",
            r#"{"id":"msg_1","role":"user","content":[]}"#,
        ))
        .await;
        let client = client(&base, ScriptedTransport { chunks: vec![], hang: false });
        client
            .add_message("thread_1", "summarize this", Some("file-9"))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/threads/thread_1/messages"));
        assert!(request.contains("summarize this"));
        assert!(request.contains("File (ID: file-9) attached."));
    }

    fn json_ok(body: &str) -> String {
        http_response("200 OK", "application/json", body)
    }

    fn no_stream() -> ScriptedTransport {
        ScriptedTransport { chunks: vec![], hang: false }
    }

    // ========================================================================
    // Assistant management
    // ========================================================================

    #[tokio::test]
    async fn test_update_assistant_posts_full_settings() {
        let (base, server) = serve_once(json_ok(
            r#"{"id":"asst_1","name":"Tutor","model":"gpt-4o","tools":[{"type":"code_interpreter"}]}"#,
        ))
        .await;
        let request = CreateAssistantRequest {
            name: Some("Tutor".into()),
            instructions: Some("Explain step by step".into()),
            model: "gpt-4o".into(),
            tools: vec!["code_interpreter".into()],
            file_ids: vec!["file-1".into()],
        };
        let assistant = client(&base, no_stream()).update_assistant("asst_1", &request).await.unwrap();
        assert_eq!(assistant.name.as_deref(), Some("Tutor"));

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /v1/assistants/asst_1 "));
        let body: Value = serde_json::from_str(raw.split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(body["instructions"], "Explain step by step");
        assert_eq!(body["tools"], json!([{"type": "code_interpreter"}]));
        assert_eq!(body["file_ids"], json!(["file-1"]));
    }

    #[tokio::test]
    async fn test_attach_file_keeps_existing_files() {
        let (base, server) = serve_many(vec![
            json_ok(r#"{"id":"asst_1","model":"gpt-4o","file_ids":["file-a"]}"#),
            json_ok(r#"{"id":"asst_1","model":"gpt-4o","file_ids":["file-a","file-b"]}"#),
        ])
        .await;
        let attached = client(&base, no_stream())
            .attach_file_to_assistant("asst_1", "file-b")
            .await
            .unwrap();
        assert_eq!(attached.id, "file-b");
        assert_eq!(attached.assistant_id, "asst_1");

        let raw = server.await.unwrap();
        let requests: Vec<&str> = raw.split('\0').collect();
        assert!(requests[0].starts_with("GET /v1/assistants/asst_1 "));
        assert!(requests[1].starts_with("POST /v1/assistants/asst_1 "));
        let body: Value = serde_json::from_str(requests[1].split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(body, json!({"file_ids": ["file-a", "file-b"]}));
    }

    #[tokio::test]
    async fn test_list_assistant_files() {
        let (base, server) =
            serve_once(json_ok(r#"{"id":"asst_1","model":"gpt-4o","file_ids":["file-a","file-b"]}"#)).await;
        let files = client(&base, no_stream()).list_assistant_files("asst_1").await.unwrap();
        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["file-a", "file-b"]);
        assert!(files.iter().all(|f| f.assistant_id == "asst_1"));
        assert!(server.await.unwrap().starts_with("GET /v1/assistants/asst_1 "));
    }

    // ========================================================================
    // Non-streaming runs
    // ========================================================================

    #[tokio::test]
    async fn test_run_to_completion_returns_reply() {
        let (base, server) = serve_many(vec![
            json_ok(r#"{"id":"run_1","status":"queued","thread_id":"thread_1"}"#),
            json_ok(r#"{"id":"run_1","status":"in_progress","thread_id":"thread_1"}"#),
            json_ok(r#"{"id":"run_1","status":"completed","thread_id":"thread_1"}"#),
            json_ok(
                r#"{"data":[
                    {"id":"msg_2","role":"assistant","run_id":"run_1","content":[{"type":"text","text":{"value":"Forty-two."}}]},
                    {"id":"msg_1","role":"user","content":[{"type":"text","text":{"value":"Answer?"}}]}
                ]}"#,
            ),
        ])
        .await;
        let reply = client(&base, no_stream())
            .run_to_completion("thread_1", "asst_1", Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(reply, "Forty-two.");

        let raw = server.await.unwrap();
        let requests: Vec<&str> = raw.split('\0').collect();
        assert!(requests[0].starts_with("POST /v1/threads/thread_1/runs "));
        assert!(requests[0].contains("\"stream\":false"));
        assert!(requests[1].starts_with("GET /v1/threads/thread_1/runs/run_1 "));
        assert!(requests[3].starts_with("GET /v1/threads/thread_1/messages "));
    }

    #[tokio::test]
    async fn test_run_to_completion_reports_failed_run() {
        let (base, _server) = serve_many(vec![
            json_ok(r#"{"id":"run_2","status":"queued","thread_id":"thread_1"}"#),
            json_ok(
                r#"{"id":"run_2","status":"failed","thread_id":"thread_1","last_error":{"code":"rate_limit_exceeded","message":"Rate limit reached"}}"#,
            ),
        ])
        .await;
        let err = client(&base, no_stream())
            .run_to_completion("thread_1", "asst_1", Duration::from_millis(5))
            .await
            .unwrap_err();
        match err {
            ChatError::RunFailed { status, message } => {
                assert_eq!(status, "failed");
                assert_eq!(message, "Rate limit reached");
            }
            other => panic!("expected run failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_empty_message_rejected() {
        let client = client("http://127.0.0.1:1/v1", ScriptedTransport { chunks: vec![], hang: false });
        let err = client.add_message("thread_1", "  ", None).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidInput(_)));
    }
}
