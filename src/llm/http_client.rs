// src/llm/http_client.rs
// Shared HTTP client configuration and API error extraction

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::error::{ChatError, Result};

/// Default maximum retry attempts for transient failures
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base backoff duration between retries (doubles each attempt)
const DEFAULT_BASE_BACKOFF_MS: u64 = 500;
/// Default connect timeout
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Shared HTTP client for the chat, assistant and file endpoints.
///
/// No overall request timeout is set: streamed responses can legitimately
/// stay open for minutes. Stalls are the server's concern.
#[derive(Debug, Clone)]
pub struct LlmHttpClient {
    client: Client,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for LlmHttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }
}

impl LlmHttpClient {
    pub fn new(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self::from_client(client)
    }

    /// Create from an existing reqwest::Client
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Execute a request with retry on 429/5xx and connect/timeout failures.
    ///
    /// Only for idempotent management calls; streamed completions are never
    /// retried automatically.
    pub async fn execute_with_retry<F>(&self, request_id: &str, build_request: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempts = 0;
        let mut backoff = self.base_backoff;

        loop {
            match build_request(&self.client).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if attempts < self.max_attempts
                        && (status.as_u16() == 429 || status.is_server_error())
                    {
                        warn!(
                            request_id = %request_id,
                            status = %status,
                            "Transient error, retrying in {:?}...",
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        backoff *= 2;
                        continue;
                    }
                    return Err(api_error(response).await);
                }
                Err(e) => {
                    if attempts < self.max_attempts && (e.is_connect() || e.is_timeout()) {
                        warn!(
                            request_id = %request_id,
                            error = %e,
                            "Request failed (connect/timeout), retrying in {:?}...",
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        backoff *= 2;
                        continue;
                    }
                    return Err(ChatError::Transport(e.to_string()));
                }
            }
        }
    }

    /// Execute with retry and decode the JSON body
    pub async fn execute_json<T, F>(&self, request_id: &str, build_request: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.execute_with_retry(request_id, build_request).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            ChatError::Protocol(format!("unexpected response body: {}", e))
        })
    }
}

/// Turn a non-2xx response into `ChatError::Api`
pub async fn api_error(response: Response) -> ChatError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ChatError::Api {
        status: status.as_u16(),
        message: error_message_from_body(status.as_u16(), &body),
    }
}

/// Best available error text: `error.message` from JSON, else the JSON
/// document, else the raw body, else the status code.
pub fn error_message_from_body(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        let nested = json
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(Value::as_str);
        if let Some(message) = nested.filter(|m| !m.is_empty()) {
            return message.to_string();
        }
        if let Some(message) = json.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
        return json.to_string();
    }
    if trimmed.is_empty() {
        format!("HTTP {}", status)
    } else {
        trimmed.to_string()
    }
}
