// src/llm/api.rs
// Authenticated JSON / multipart calls against the OpenAI REST surface

use reqwest::multipart::Form;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use super::http_client::LlmHttpClient;
use crate::config::Credentials;
use crate::error::{ChatError, Result};

/// Header value required by the assistants endpoints
pub const ASSISTANTS_BETA: &str = "assistants=v2";

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: LlmHttpClient,
    base_url: String,
    credentials: Credentials,
    beta: Option<String>,
}

impl ApiClient {
    pub fn new(http: LlmHttpClient, base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            beta: None,
        }
    }

    /// Send `OpenAI-Beta: assistants=v2` with every call
    pub fn with_assistants_beta(mut self) -> Self {
        self.beta = Some(ASSISTANTS_BETA.to_string());
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn http(&self) -> &LlmHttpClient {
        &self.http
    }

    /// Request builder with auth and beta headers applied
    fn build(&self, client: &Client, method: Method, url: &str, api_key: &str) -> RequestBuilder {
        let mut req = client.request(method, url).bearer_auth(api_key);
        if let Some(beta) = &self.beta {
            req = req.header("OpenAI-Beta", beta.as_str());
        }
        req
    }

    fn api_key(&self) -> Result<&str> {
        self.credentials.api_key().ok_or(ChatError::MissingCredentials)
    }

    /// JSON request with retry, JSON response
    #[instrument(skip(self, body), fields(request_id))]
    pub async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let api_key = self.api_key()?;
        let url = self.url(path);
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());
        debug!(request_id = %request_id, method = %method, url = %url, "API call");

        self.http
            .execute_json(&request_id, |client| {
                let req = self.build(client, method.clone(), &url, api_key);
                match body {
                    Some(body) => req.json(body),
                    None => req,
                }
            })
            .await
    }

    /// GET returning the raw body text
    #[instrument(skip(self), fields(request_id))]
    pub async fn text(&self, path: &str) -> Result<String> {
        let api_key = self.api_key()?;
        let url = self.url(path);
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());

        let response = self
            .http
            .execute_with_retry(&request_id, |client| {
                self.build(client, Method::GET, &url, api_key)
            })
            .await?;
        Ok(response.text().await?)
    }

    /// Multipart POST; `form` is rebuilt for every attempt
    #[instrument(skip(self, form), fields(request_id))]
    pub async fn multipart<T, F>(&self, path: &str, form: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> Form,
    {
        let api_key = self.api_key()?;
        let url = self.url(path);
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());

        // reqwest sets the multipart Content-Type itself
        self.http
            .execute_json(&request_id, |client| {
                self.build(client, Method::POST, &url, api_key).multipart(form())
            })
            .await
    }
}
