//! `reqwest` implementation of [`StorageClient`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::{FileUpdate, ProjectSnapshot, StorageClient, StorageError, StoredFile};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage API over HTTP.
pub struct HttpStore {
    /// API root, e.g. `http://localhost:5173/api`
    base_url: String,
    /// Session token sent as a bearer credential
    token: Option<String>,
    client: Client,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            client,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn project_url(&self, room: &str) -> String {
        format!("{}/projects/{}", self.base_url, room)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StorageError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| StorageError::NetworkFailure(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        log::debug!("Store request failed: {status} {body}");
        Err(StorageError::from_status(status.as_u16()))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StorageError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| StorageError::NetworkFailure(e.to_string()))
    }
}

#[derive(Deserialize)]
struct ContentBody {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl StorageClient for HttpStore {
    async fn fetch_project(&self, room: &str) -> Result<ProjectSnapshot, StorageError> {
        self.send_json(self.client.get(self.project_url(room))).await
    }

    async fn create_project(&self, room: &str, name: &str) -> Result<ProjectSnapshot, StorageError> {
        let request = self
            .client
            .post(self.project_url(room))
            .json(&json!({ "name": name }));
        self.send_json(request).await
    }

    async fn create_file(&self, room: &str, file: &StoredFile) -> Result<(), StorageError> {
        let url = format!("{}/files", self.project_url(room));
        self.send(self.client.post(url).json(file)).await?;
        Ok(())
    }

    async fn update_file(
        &self,
        room: &str,
        file_id: &str,
        updates: &FileUpdate,
    ) -> Result<(), StorageError> {
        let url = format!("{}/files", self.project_url(room));
        let body = json!({ "fileId": file_id, "updates": updates });
        self.send(self.client.patch(url).json(&body)).await?;
        Ok(())
    }

    async fn delete_file(&self, room: &str, file_id: &str) -> Result<(), StorageError> {
        let url = format!("{}/files", self.project_url(room));
        let body = json!({ "fileId": file_id });
        self.send(self.client.delete(url).json(&body)).await?;
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        let url = format!("{}/projects", self.base_url);
        self.send(self.client.get(url)).await.is_ok()
    }

    async fn fetch_content(&self, room: &str) -> Result<String, StorageError> {
        let url = format!("{}/content", self.project_url(room));
        let body: ContentBody = self.send_json(self.client.get(url)).await?;
        Ok(body.content.unwrap_or_default())
    }

    async fn save_content(
        &self,
        room: &str,
        content: &str,
        create: bool,
    ) -> Result<(), StorageError> {
        let url = format!("{}/content", self.project_url(room));
        let body = json!({ "content": content });
        let request = if create {
            self.client.post(url)
        } else {
            self.client.patch(url)
        };
        self.send(request.json(&body)).await?;
        Ok(())
    }
}
