use ferro_core::{Task, TaskId};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {0}")]
    Status(StatusCode),
}

/// Thin wrapper over the backend's task endpoints. One method per
/// consumed route; the backend itself is out of scope.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: Url) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(ApiClient { http, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    /// `GET /tasks` — the authoritative task list on load.
    pub async fn list_tasks(&self) -> Result<Vec<Task>, ApiError> {
        let resp = self.http.get(self.endpoint("/tasks")).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }

    /// `POST /tasks` — create a task from the first message of a draft.
    pub async fn create_task(&self, description: &str) -> Result<Task, ApiError> {
        let resp = self
            .http
            .post(self.endpoint("/tasks"))
            .json(&json!({ "description": description }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }

    /// `POST /tasks/{id}/messages` — fire-and-forget from the UI's
    /// perspective; the acknowledgement body is ignored.
    pub async fn send_message(&self, id: &TaskId, message: &str) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.endpoint(&format!("/tasks/{id}/messages")))
            .json(&json!({ "message": message }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status()));
        }
        Ok(())
    }

    /// `POST /tasks/{id}/cancel` — acknowledgement only.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.endpoint(&format!("/tasks/{id}/cancel")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status()));
        }
        Ok(())
    }
}
