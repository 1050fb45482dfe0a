// src/llm/transport.rs
// Streaming HTTP transport: one POST, raw body chunks out

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header;
use serde_json::Value;
use std::pin::Pin;
use tracing::{debug, info, instrument};

use super::http_client::{LlmHttpClient, api_error};
use crate::config::Credentials;
use crate::error::{ChatError, Result};

/// Raw body chunks as they arrive from the server
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Opens a streaming request and yields the response body.
///
/// A non-2xx status or a network failure is returned as an error from
/// `open`; errors mid-body arrive as `Err` items in the stream. Dropping
/// the stream aborts the read.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, endpoint: &str, body: Value, credentials: &Credentials) -> Result<ByteStream>;
}

/// reqwest-backed transport
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: LlmHttpClient,
    extra_headers: Vec<(String, String)>,
}

impl HttpTransport {
    pub fn new(http: LlmHttpClient) -> Self {
        Self {
            http,
            extra_headers: Vec::new(),
        }
    }

    /// Add a header sent with every request (e.g. `OpenAI-Beta`)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, body, credentials), fields(request_id))]
    async fn open(&self, endpoint: &str, mut body: Value, credentials: &Credentials) -> Result<ByteStream> {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());

        let api_key = credentials.api_key().ok_or(ChatError::MissingCredentials)?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".into(), Value::Bool(true));
        }

        let mut req = self
            .http
            .inner()
            .post(endpoint)
            .header(header::AUTHORIZATION, format!("Bearer {}", api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream");
        for (name, value) in &self.extra_headers {
            req = req.header(name.as_str(), value.as_str());
        }

        debug!(request_id = %request_id, endpoint = %endpoint, "Opening stream");
        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let err = api_error(resp).await;
            info!(request_id = %request_id, error = %err, "Stream rejected");
            return Err(err);
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ChatError::Transport(e.to_string())));
        Ok(Box::pin(stream))
    }
}
