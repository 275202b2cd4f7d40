//! Vibe-Kanban backend over its local HTTP API.
//!
//! VK runs as a companion service; bosun mirrors tasks onto its board
//! through plain JSON endpoints. VK stores arbitrary JSON per task, so
//! the shared-state record always travels as a single JSON field.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use bosun_db::models::{KanbanBackendKind, TaskStatus};

use super::shared_state::SharedState;
use super::status_map::parse_external_status;
use super::{BackendError, CANONICAL_LABEL, ExternalItem, KanbanBackend};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Vibe-Kanban backend.
pub struct VibeKanbanBackend {
    base_url: String,
    http: reqwest::Client,
}

impl VibeKanbanBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, BackendError> {
        let mut builder = self.http.request(method, self.url(path));
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(BackendError::Protocol(format!(
                "vibe-kanban returned {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| BackendError::Protocol(e.to_string()))
    }
}

/// Internal status names as VK spells them.
fn vk_status_name(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "todo",
        TaskStatus::InProgress | TaskStatus::Failed => "inprogress",
        TaskStatus::InReview => "inreview",
        TaskStatus::Done => "done",
        TaskStatus::Cancelled => "cancelled",
    }
}

#[derive(Debug, Deserialize)]
struct VkTask {
    id: String,
    title: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    shared_state: Option<serde_json::Value>,
}

#[async_trait]
impl KanbanBackend for VibeKanbanBackend {
    fn kind(&self) -> KanbanBackendKind {
        KanbanBackendKind::VibeKanban
    }

    async fn fetch_items(&self) -> Result<Vec<ExternalItem>, BackendError> {
        let value = self
            .request(
                reqwest::Method::GET,
                &format!("/api/tasks?label={CANONICAL_LABEL}"),
                None,
            )
            .await?;
        let tasks: Vec<VkTask> = serde_json::from_value(value)
            .map_err(|e| BackendError::Protocol(e.to_string()))?;

        Ok(tasks
            .into_iter()
            .map(|task| ExternalItem {
                url: self.url(&format!("/tasks/{}", task.id)),
                status: task.status.as_deref().and_then(vk_parse_status),
                shared_state: task
                    .shared_state
                    .and_then(|v| serde_json::from_value::<SharedState>(v).ok()),
                id: task.id,
                title: task.title,
                labels: task.labels,
            })
            .collect())
    }

    async fn create_item(
        &self,
        title: &str,
        labels: &[String],
    ) -> Result<ExternalItem, BackendError> {
        let created = self
            .request(
                reqwest::Method::POST,
                "/api/tasks",
                Some(&json!({ "title": title, "labels": labels, "status": "todo" })),
            )
            .await?;
        let id = created
            .get("id")
            .and_then(|i| i.as_str())
            .ok_or_else(|| BackendError::Protocol("create response has no id".to_string()))?
            .to_string();
        Ok(ExternalItem {
            url: self.url(&format!("/tasks/{id}")),
            id,
            title: title.to_string(),
            status: Some(TaskStatus::Todo),
            labels: labels.to_vec(),
            shared_state: None,
        })
    }

    async fn update_status(
        &self,
        external_id: &str,
        status: TaskStatus,
    ) -> Result<(), BackendError> {
        self.request(
            reqwest::Method::PUT,
            &format!("/api/tasks/{external_id}/status"),
            Some(&json!({ "status": vk_status_name(status) })),
        )
        .await?;
        Ok(())
    }

    async fn add_labels(
        &self,
        external_id: &str,
        labels: &[String],
    ) -> Result<(), BackendError> {
        self.request(
            reqwest::Method::POST,
            &format!("/api/tasks/{external_id}/labels"),
            Some(&json!({ "add": labels })),
        )
        .await?;
        Ok(())
    }

    async fn write_shared_state(
        &self,
        external_id: &str,
        state: &SharedState,
    ) -> Result<(), BackendError> {
        self.request(
            reqwest::Method::PUT,
            &format!("/api/tasks/{external_id}/shared-state"),
            Some(
                &serde_json::to_value(state)
                    .map_err(|e| BackendError::Protocol(e.to_string()))?,
            ),
        )
        .await?;
        Ok(())
    }

    async fn add_comment(&self, external_id: &str, body: &str) -> Result<(), BackendError> {
        self.request(
            reqwest::Method::POST,
            &format!("/api/tasks/{external_id}/comments"),
            Some(&json!({ "body": body })),
        )
        .await?;
        Ok(())
    }
}

/// Parse VK's status strings, falling back to the shared synonym table.
fn vk_parse_status(raw: &str) -> Option<TaskStatus> {
    match raw {
        "todo" => Some(TaskStatus::Todo),
        "inprogress" => Some(TaskStatus::InProgress),
        "inreview" => Some(TaskStatus::InReview),
        "done" => Some(TaskStatus::Done),
        "cancelled" => Some(TaskStatus::Cancelled),
        other => parse_external_status(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip() {
        for status in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Done,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(vk_parse_status(vk_status_name(status)), Some(status));
        }
    }

    #[test]
    fn failed_maps_to_inprogress_column() {
        assert_eq!(vk_status_name(TaskStatus::Failed), "inprogress");
    }

    #[test]
    fn vk_task_deserialization() {
        let raw = r#"{
            "id": "t-1",
            "title": "feat(api): add X",
            "status": "inreview",
            "labels": ["bosun"],
            "shared_state": { "ownerId": "host-1", "retryCount": 1 }
        }"#;
        let task: VkTask = serde_json::from_str(raw).unwrap();
        assert_eq!(task.id, "t-1");
        assert_eq!(task.status.as_deref(), Some("inreview"));
        let state: SharedState =
            serde_json::from_value(task.shared_state.unwrap()).unwrap();
        assert_eq!(state.owner_id.as_deref(), Some("host-1"));
        assert_eq!(state.retry_count, 1);
    }
}
