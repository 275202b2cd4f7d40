//! Jira backend over REST v3.
//!
//! Custom fields are auto-discovered through `/rest/api/3/field`, so
//! deployments can carry the shared-state record either in one JSON
//! custom field, in multiple typed fields, or (when no fields are
//! provisioned) in marker comments. Subtask issue types require a
//! configured parent key.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;

use bosun_db::models::{KanbanBackendKind, TaskStatus};

use super::shared_state::{SharedState, SharedStateMode};
use super::status_map::{match_status_option, parse_external_status};
use super::{BackendError, CANONICAL_LABEL, ExternalItem, KanbanBackend};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Name of the JSON custom field holding the whole record.
const JSON_FIELD_NAME: &str = "Bosun Shared State";

/// Names of the typed custom fields, matching the record's field names.
const TYPED_FIELD_NAMES: &[&str] = &[
    "ownerId",
    "attemptToken",
    "attemptStarted",
    "heartbeat",
    "retryCount",
    "ignoreReason",
];

/// Jira connection and project settings.
#[derive(Debug, Clone)]
pub struct JiraConfig {
    /// Site base URL, e.g. `https://example.atlassian.net`.
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub project_key: String,
    /// Issue type name for created items, e.g. "Task" or "Sub-task".
    pub issue_type: String,
    /// Required when `issue_type` is a subtask type.
    pub parent_key: Option<String>,
    pub shared_state_mode: SharedStateMode,
}

/// One discovered Jira field.
#[derive(Debug, Clone, Deserialize)]
pub struct JiraField {
    pub id: String,
    pub name: String,
}

/// Jira backend.
pub struct JiraBackend {
    config: JiraConfig,
    http: reqwest::Client,
    fields: OnceCell<Vec<JiraField>>,
}

impl JiraBackend {
    pub fn new(config: JiraConfig) -> Result<Self, BackendError> {
        if config.api_token.trim().is_empty() {
            return Err(BackendError::AuthMissing {
                hint: "set the Jira API token in the kanban configuration".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self {
            config,
            http,
            fields: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn check_status(status: reqwest::StatusCode, body: &str) -> Result<(), BackendError> {
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(BackendError::AuthMissing {
                hint: "check the Jira email/API token pair".to_string(),
            });
        }
        if !status.is_success() {
            return Err(BackendError::Protocol(format!(
                "jira returned {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, BackendError> {
        let response = self
            .http
            .get(self.url(path))
            .basic_auth(&self.config.email, Some(&self.config.api_token))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Self::check_status(status, &body)?;
        serde_json::from_str(&body).map_err(|e| BackendError::Protocol(e.to_string()))
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, BackendError> {
        let response = self
            .http
            .request(method, self.url(path))
            .basic_auth(&self.config.email, Some(&self.config.api_token))
            .json(payload)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Self::check_status(status, &body)?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&body).ok())
    }

    /// All fields known to the site, discovered once and cached.
    async fn discover_fields(&self) -> Result<&[JiraField], BackendError> {
        let fields = self
            .fields
            .get_or_try_init(|| async {
                let value = self.get("/rest/api/3/field").await?;
                serde_json::from_value::<Vec<JiraField>>(value)
                    .map_err(|e| BackendError::Protocol(e.to_string()))
            })
            .await?;
        Ok(fields)
    }

    async fn field_id_by_name(&self, name: &str) -> Result<Option<String>, BackendError> {
        Ok(self
            .discover_fields()
            .await?
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.id.clone()))
    }
}

#[async_trait]
impl KanbanBackend for JiraBackend {
    fn kind(&self) -> KanbanBackendKind {
        KanbanBackendKind::Jira
    }

    async fn fetch_items(&self) -> Result<Vec<ExternalItem>, BackendError> {
        let jql = format!(
            "project = {} AND labels = {CANONICAL_LABEL} ORDER BY created ASC",
            self.config.project_key
        );
        let value = self
            .get(&format!(
                "/rest/api/3/search?jql={}&fields=summary,labels,status",
                urlencode(&jql)
            ))
            .await?;
        parse_search_result(&value, &self.config.base_url)
            .ok_or_else(|| BackendError::Protocol("unparseable search result".to_string()))
    }

    async fn create_item(
        &self,
        title: &str,
        labels: &[String],
    ) -> Result<ExternalItem, BackendError> {
        let mut fields = json!({
            "project": { "key": self.config.project_key },
            "summary": title,
            "issuetype": { "name": self.config.issue_type },
            "labels": labels,
        });

        if is_subtask_type(&self.config.issue_type) {
            let Some(parent) = &self.config.parent_key else {
                return Err(BackendError::Protocol(format!(
                    "issue type {:?} is a subtask type and requires a parent key",
                    self.config.issue_type
                )));
            };
            fields["parent"] = json!({ "key": parent });
        }

        let created = self
            .send_json(
                reqwest::Method::POST,
                "/rest/api/3/issue",
                &json!({ "fields": fields }),
            )
            .await?
            .ok_or_else(|| BackendError::Protocol("empty create response".to_string()))?;

        let key = created
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| BackendError::Protocol("create response has no key".to_string()))?
            .to_string();

        Ok(ExternalItem {
            url: format!("{}/browse/{key}", self.config.base_url.trim_end_matches('/')),
            id: key,
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
        let value = self
            .get(&format!("/rest/api/3/issue/{external_id}/transitions"))
            .await?;
        let transitions = parse_transitions(&value);
        let names: Vec<String> = transitions.iter().map(|(_, name)| name.clone()).collect();

        let Some(matched) = match_status_option(&names, status) else {
            tracing::warn!(
                issue = external_id,
                status = %status,
                "no matching Jira transition, leaving issue as-is"
            );
            return Ok(());
        };
        let Some(transition_id) = transitions
            .iter()
            .find(|(_, name)| name == matched)
            .map(|(id, _)| id.clone())
        else {
            return Ok(());
        };

        self.send_json(
            reqwest::Method::POST,
            &format!("/rest/api/3/issue/{external_id}/transitions"),
            &json!({ "transition": { "id": transition_id } }),
        )
        .await?;
        Ok(())
    }

    async fn add_labels(
        &self,
        external_id: &str,
        labels: &[String],
    ) -> Result<(), BackendError> {
        let adds: Vec<serde_json::Value> = labels.iter().map(|l| json!({ "add": l })).collect();
        self.send_json(
            reqwest::Method::PUT,
            &format!("/rest/api/3/issue/{external_id}"),
            &json!({ "update": { "labels": adds } }),
        )
        .await?;
        Ok(())
    }

    async fn write_shared_state(
        &self,
        external_id: &str,
        state: &SharedState,
    ) -> Result<(), BackendError> {
        match self.config.shared_state_mode {
            SharedStateMode::Json => {
                let Some(field_id) = self.field_id_by_name(JSON_FIELD_NAME).await? else {
                    // Field not provisioned; fall back to a comment so
                    // the record is never silently dropped.
                    return self.add_comment(external_id, &state.to_comment()).await;
                };
                self.send_json(
                    reqwest::Method::PUT,
                    &format!("/rest/api/3/issue/{external_id}"),
                    &json!({ "fields": { field_id: state.to_json() } }),
                )
                .await?;
                Ok(())
            }
            SharedStateMode::Fields => {
                let mut fields = serde_json::Map::new();
                let values = state.to_fields();
                for name in TYPED_FIELD_NAMES {
                    if let Some(field_id) = self.field_id_by_name(name).await? {
                        let value = values
                            .get(*name)
                            .cloned()
                            .map(serde_json::Value::String)
                            .unwrap_or(serde_json::Value::Null);
                        fields.insert(field_id, value);
                    }
                }
                if fields.is_empty() {
                    return self.add_comment(external_id, &state.to_comment()).await;
                }
                self.send_json(
                    reqwest::Method::PUT,
                    &format!("/rest/api/3/issue/{external_id}"),
                    &json!({ "fields": fields }),
                )
                .await?;
                Ok(())
            }
            SharedStateMode::Comments => {
                self.add_comment(external_id, &state.to_comment()).await
            }
        }
    }

    async fn add_comment(&self, external_id: &str, body: &str) -> Result<(), BackendError> {
        // Comment bodies are Atlassian Document Format.
        let adf = json!({
            "body": {
                "type": "doc",
                "version": 1,
                "content": [{
                    "type": "paragraph",
                    "content": [{ "type": "text", "text": body }]
                }]
            }
        });
        self.send_json(
            reqwest::Method::POST,
            &format!("/rest/api/3/issue/{external_id}/comment"),
            &adf,
        )
        .await?;
        Ok(())
    }
}

/// Whether an issue type name denotes a subtask type.
fn is_subtask_type(issue_type: &str) -> bool {
    let normalized: String = issue_type
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    normalized.contains("subtask")
}

/// Minimal percent-encoding for JQL query strings.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn parse_search_result(value: &serde_json::Value, base_url: &str) -> Option<Vec<ExternalItem>> {
    let issues = value.get("issues")?.as_array()?;
    let base = base_url.trim_end_matches('/');

    Some(
        issues
            .iter()
            .filter_map(|issue| {
                let key = issue.get("key")?.as_str()?.to_string();
                let fields = issue.get("fields")?;
                let title = fields
                    .get("summary")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string();
                let labels = fields
                    .get("labels")
                    .and_then(|l| l.as_array())
                    .map(|l| {
                        l.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                let status = fields
                    .get("status")
                    .and_then(|s| s.get("name"))
                    .and_then(|n| n.as_str())
                    .and_then(parse_external_status)
                    .or_else(|| {
                        // Fall back to the coarse status category.
                        fields
                            .get("status")?
                            .get("statusCategory")?
                            .get("name")?
                            .as_str()
                            .and_then(parse_external_status)
                    });

                Some(ExternalItem {
                    url: format!("{base}/browse/{key}"),
                    id: key,
                    title,
                    status,
                    labels,
                    shared_state: None,
                })
            })
            .collect(),
    )
}

fn parse_transitions(value: &serde_json::Value) -> Vec<(String, String)> {
    value
        .get("transitions")
        .and_then(|t| t.as_array())
        .map(|transitions| {
            transitions
                .iter()
                .filter_map(|t| {
                    Some((
                        t.get("id")?.as_str()?.to_string(),
                        t.get("name")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtask_detection() {
        assert!(is_subtask_type("Sub-task"));
        assert!(is_subtask_type("Subtask"));
        assert!(is_subtask_type("sub task"));
        assert!(!is_subtask_type("Task"));
        assert!(!is_subtask_type("Story"));
    }

    #[test]
    fn missing_token_is_auth_error() {
        let config = JiraConfig {
            base_url: "https://x.atlassian.net".into(),
            email: "a@b.c".into(),
            api_token: "".into(),
            project_key: "BOS".into(),
            issue_type: "Task".into(),
            parent_key: None,
            shared_state_mode: SharedStateMode::Json,
        };
        assert!(matches!(
            JiraBackend::new(config),
            Err(BackendError::AuthMissing { .. })
        ));
    }

    #[test]
    fn search_result_parsing() {
        let value = serde_json::json!({
            "issues": [
                {
                    "key": "BOS-7",
                    "fields": {
                        "summary": "feat(api): add X",
                        "labels": ["bosun"],
                        "status": {
                            "name": "In Review",
                            "statusCategory": { "name": "In Progress" }
                        }
                    }
                },
                {
                    "key": "BOS-8",
                    "fields": {
                        "summary": "fix: y",
                        "labels": [],
                        "status": {
                            "name": "Weird Custom Column",
                            "statusCategory": { "name": "Done" }
                        }
                    }
                }
            ]
        });
        let items = parse_search_result(&value, "https://x.atlassian.net/").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "BOS-7");
        assert_eq!(items[0].status, Some(TaskStatus::InReview));
        assert_eq!(items[0].url, "https://x.atlassian.net/browse/BOS-7");
        // Unknown column name falls back to the status category.
        assert_eq!(items[1].status, Some(TaskStatus::Done));
    }

    #[test]
    fn transition_parsing() {
        let value = serde_json::json!({
            "transitions": [
                { "id": "11", "name": "To Do" },
                { "id": "21", "name": "In Progress" },
                { "id": "31", "name": "Done" }
            ]
        });
        let transitions = parse_transitions(&value);
        assert_eq!(transitions.len(), 3);
        assert_eq!(transitions[1], ("21".to_string(), "In Progress".to_string()));
    }

    #[test]
    fn jql_encoding() {
        assert_eq!(urlencode("a = b"), "a%20%3D%20b");
        assert_eq!(urlencode("plain-text_1.2~"), "plain-text_1.2~");
    }
}
