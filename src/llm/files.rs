// src/llm/files.rs
// File collaborator: uploads, content retrieval, vector stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::path::Path;
use tracing::{info, instrument};

use super::api::ApiClient;
use crate::conversation::FileRef;
use crate::error::{ChatError, Result};

/// Purpose sent with uploads so assistants and vector stores can use them
pub const UPLOAD_PURPOSE: &str = "assistants";

/// Uploading and reading back files referenced by messages
#[async_trait]
pub trait FileCollaborator: Send + Sync {
    async fn upload_file(&self, path: &Path) -> Result<FileRef>;
    async fn retrieve_file_content(&self, file_id: &str) -> Result<String>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStore {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_bytes: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStoreFile {
    pub id: String,
    pub vector_store_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

/// Unix seconds or RFC 3339
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TimestampFormat {
        UnixTimestamp(i64),
        DateTimeString(String),
    }

    match TimestampFormat::deserialize(deserializer)? {
        TimestampFormat::UnixTimestamp(ts) => DateTime::from_timestamp(ts, 0)
            .ok_or_else(|| serde::de::Error::custom("Invalid Unix timestamp")),
        TimestampFormat::DateTimeString(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}

/// OpenAI files + vector stores
#[derive(Debug, Clone)]
pub struct OpenAiFiles {
    api: ApiClient,
}

impl OpenAiFiles {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Upload in-memory bytes under `file_name`
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub async fn upload_bytes(&self, file_name: &str, content: Vec<u8>) -> Result<FileRef> {
        let mime = mime_guess::from_path(file_name).first_or_octet_stream();
        let mime_type = mime.essence_str().to_string();

        let uploaded: FileObject = self
            .api
            .multipart("files", || {
                let part = Part::bytes(content.clone())
                    .file_name(file_name.to_string())
                    .mime_str(&mime_type)
                    .unwrap_or_else(|_| Part::bytes(content.clone()).file_name(file_name.to_string()));
                Form::new().text("purpose", UPLOAD_PURPOSE).part("file", part)
            })
            .await?;

        info!(file_id = %uploaded.id, name = %file_name, "File uploaded");
        Ok(FileRef::new(uploaded.id, file_name, mime_type))
    }

    pub async fn create_vector_store(&self, name: &str, file_ids: &[String]) -> Result<VectorStore> {
        let mut body = json!({ "name": name });
        if !file_ids.is_empty() {
            body["file_ids"] = json!(file_ids);
        }
        let store: VectorStore = self.api.json(Method::POST, "vector_stores", Some(&body)).await?;
        info!(vector_store = %store.id, files = file_ids.len(), "Vector store created");
        Ok(store)
    }

    /// Attach files one by one; stops at the first failure
    pub async fn add_files_to_vector_store(
        &self,
        vector_store_id: &str,
        file_ids: &[String],
    ) -> Result<Vec<VectorStoreFile>> {
        let path = format!("vector_stores/{}/files", vector_store_id);
        let mut attached = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let body = json!({ "file_id": file_id });
            attached.push(self.api.json(Method::POST, &path, Some(&body)).await?);
        }
        Ok(attached)
    }

    pub async fn list_vector_stores(&self) -> Result<Vec<VectorStore>> {
        let list: ListResponse<VectorStore> = self.api.json(Method::GET, "vector_stores", None).await?;
        Ok(list.data)
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        let _: Value = self
            .api
            .json(Method::DELETE, &format!("files/{}", file_id), None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FileCollaborator for OpenAiFiles {
    async fn upload_file(&self, path: &Path) -> Result<FileRef> {
        let content = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ChatError::InvalidInput(format!("not a file path: {}", path.display())))?;
        self.upload_bytes(file_name, content).await
    }

    async fn retrieve_file_content(&self, file_id: &str) -> Result<String> {
        self.api.text(&format!("files/{}/content", file_id)).await
    }
}
