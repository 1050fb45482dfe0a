// src/llm/completion.rs
// Non-streaming chat completion: one request, the whole reply at once

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::api::ApiClient;
use super::request::ChatRequest;
use crate::error::Result;

/// Token accounting reported with a completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A finished reply
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
    /// Model that actually served the request
    pub model: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// POST `chat/completions` with `stream: false`. A reply without text
/// content (tool calls only) comes back as an empty string.
#[instrument(skip(api, request), fields(model = %request.model))]
pub async fn complete(api: &ApiClient, request: ChatRequest) -> Result<Completion> {
    let body = request.streaming(false).to_value()?;
    let response: CompletionResponse = api.json(Method::POST, "chat/completions", Some(&body)).await?;

    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .unwrap_or_default();
    info!(
        model = %response.model,
        chars = content.len(),
        total_tokens = response.usage.map(|u| u.total_tokens),
        "Completion received"
    );
    Ok(Completion {
        content,
        usage: response.usage,
        model: response.model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::conversation::Message;
    use crate::error::ChatError;
    use crate::llm::http_client::LlmHttpClient;
    use crate::test_support::{http_response, serve_once};
    use serde_json::Value;
    use std::time::Duration;

    fn api(base: &str) -> ApiClient {
        let mut http = LlmHttpClient::new(Duration::from_secs(2));
        http.max_attempts = 0;
        ApiClient::new(http, base, Credentials::new("sk-test"))
    }

    #[tokio::test]
    async fn test_complete_returns_content_usage_and_model() {
        let (base, server) = serve_once(http_response(
            "200 OK",
            "application/json",
            r#"{"id":"chatcmpl-1","model":"gpt-4o-2024-08-06","choices":[{"index":0,"message":{"role":"assistant","content":"Paris."},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":2,"total_tokens":14}}"#,
        ))
        .await;
        let request = ChatRequest::new("gpt-4o", &[Message::user("Capital of France?")]).with_max_tokens(50);
        let completion = complete(&api(&base), request).await.unwrap();

        assert_eq!(completion.content, "Paris.");
        assert_eq!(completion.model, "gpt-4o-2024-08-06");
        assert_eq!(
            completion.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 2,
                total_tokens: 14
            })
        );

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /v1/chat/completions "));
        let body: Value = serde_json::from_str(raw.split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(body["stream"], false);
        assert_eq!(body["max_tokens"], 50);
        assert_eq!(body["messages"][0]["content"], "Capital of France?");
    }

    #[tokio::test]
    async fn test_complete_without_content() {
        let (base, _server) = serve_once(http_response(
            "200 OK",
            "application/json",
            r#"{"model":"gpt-4o","choices":[{"message":{"role":"assistant","content":null,"tool_calls":[]}}]}"#,
        ))
        .await;
        let completion = complete(&api(&base), ChatRequest::new("gpt-4o", &[Message::user("x")]))
            .await
            .unwrap();
        assert_eq!(completion.content, "");
        assert!(completion.usage.is_none());
    }

    #[tokio::test]
    async fn test_complete_error_carries_server_message() {
        let (base, _server) = serve_once(http_response(
            "400 Bad Request",
            "application/json",
            r#"{"error":{"message":"max_tokens is too large"}}"#,
        ))
        .await;
        let err = complete(&api(&base), ChatRequest::new("gpt-4o", &[Message::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Api { status: 400, .. }));
        assert_eq!(err.reason(), "max_tokens is too large");
    }
}
