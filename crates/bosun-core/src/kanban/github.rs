//! GitHub backend: Issues for items, Projects V2 for board status.
//!
//! All interaction goes through the `gh` CLI so the orchestrator shares
//! the operator's existing authentication. Issue state carries the
//! coarse status (open/closed); when a project is configured, the board
//! column is set by matching the project's Status options against the
//! internal vocabulary.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::process::Command;

use bosun_db::models::{KanbanBackendKind, TaskStatus};

use super::shared_state::SharedState;
use super::status_map::match_status_option;
use super::{BackendError, CANONICAL_LABEL, ExternalItem, KanbanBackend};

const GH_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Project board coordinates, when board sync is enabled.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// Project owner login (user or org).
    pub owner: String,
    /// Project number as shown in its URL.
    pub number: u32,
}

/// GitHub backend over the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GithubBackend {
    /// `owner/name` repository slug.
    repo: String,
    project: Option<ProjectConfig>,
}

impl GithubBackend {
    pub fn new(repo: impl Into<String>, project: Option<ProjectConfig>) -> Self {
        Self {
            repo: repo.into(),
            project,
        }
    }

    /// Run `gh` with arguments, mapping failures into backend errors.
    async fn run_gh(&self, args: &[&str]) -> Result<String, BackendError> {
        let mut cmd = Command::new("gh");
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(GH_TIMEOUT, cmd.output())
            .await
            .map_err(|_| BackendError::Unavailable(format!("gh {} timed out", args.join(" "))))?
            .map_err(|e| BackendError::Unavailable(format!("failed to run gh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("gh auth login") || stderr.contains("authentication") {
                return Err(BackendError::AuthMissing {
                    hint: "gh auth login".to_string(),
                });
            }
            return Err(BackendError::Unavailable(format!(
                "gh {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Verify the repository is reachable with the current credentials.
    pub async fn check_access(&self) -> Result<(), BackendError> {
        self.run_gh(&["repo", "view", &self.repo, "--json", "name"])
            .await?;
        self.run_gh(&["api", "user"]).await?;
        Ok(())
    }

    /// Discover the project's Status single-select options.
    async fn status_options(&self, project: &ProjectConfig) -> Result<StatusField, BackendError> {
        let number = project.number.to_string();
        let raw = self
            .run_gh(&[
                "project",
                "field-list",
                &number,
                "--owner",
                &project.owner,
                "--format",
                "json",
            ])
            .await?;
        parse_status_field(&raw)
            .ok_or_else(|| BackendError::Protocol("project has no Status field".to_string()))
    }

    /// Find the project item wrapping an issue, by content URL.
    async fn find_project_item(
        &self,
        project: &ProjectConfig,
        issue_url: &str,
    ) -> Result<Option<ProjectItem>, BackendError> {
        let number = project.number.to_string();
        let raw = self
            .run_gh(&[
                "project",
                "item-list",
                &number,
                "--owner",
                &project.owner,
                "--format",
                "json",
            ])
            .await?;
        Ok(parse_project_item(&raw, issue_url))
    }

    /// Set the board column for an issue when a project is configured.
    async fn set_board_status(
        &self,
        issue_url: &str,
        status: TaskStatus,
    ) -> Result<(), BackendError> {
        let Some(project) = &self.project else {
            return Ok(());
        };

        let field = self.status_options(project).await?;
        let option_names: Vec<String> = field.options.iter().map(|o| o.name.clone()).collect();
        let Some(matched) = match_status_option(&option_names, status) else {
            tracing::warn!(
                status = %status,
                "no matching Status option on the project board"
            );
            return Ok(());
        };
        let Some(option_id) = field
            .options
            .iter()
            .find(|o| o.name == matched)
            .map(|o| o.id.clone())
        else {
            return Ok(());
        };

        if field.project_id.is_empty() {
            tracing::warn!("project field listing carried no project id; skipping board update");
            return Ok(());
        }

        let Some(item) = self.find_project_item(project, issue_url).await? else {
            tracing::debug!(url = issue_url, "issue is not on the project board");
            return Ok(());
        };

        self.run_gh(&[
            "project",
            "item-edit",
            "--id",
            &item.id,
            "--project-id",
            &field.project_id,
            "--field-id",
            &field.field_id,
            "--single-select-option-id",
            &option_id,
        ])
        .await?;
        Ok(())
    }

    fn issue_url(&self, number: &str) -> String {
        format!("https://github.com/{}/issues/{number}", self.repo)
    }
}

#[async_trait]
impl KanbanBackend for GithubBackend {
    fn kind(&self) -> KanbanBackendKind {
        KanbanBackendKind::Github
    }

    async fn fetch_items(&self) -> Result<Vec<ExternalItem>, BackendError> {
        let raw = self
            .run_gh(&[
                "issue",
                "list",
                "--repo",
                &self.repo,
                "--label",
                CANONICAL_LABEL,
                "--state",
                "all",
                "--json",
                "number,title,state,url,labels,body",
            ])
            .await?;
        parse_issue_list(&raw)
            .ok_or_else(|| BackendError::Protocol("unparseable issue list".to_string()))
    }

    async fn create_item(
        &self,
        title: &str,
        labels: &[String],
    ) -> Result<ExternalItem, BackendError> {
        let label_arg = labels.join(",");
        let url = self
            .run_gh(&[
                "issue",
                "create",
                "--repo",
                &self.repo,
                "--title",
                title,
                "--body",
                "",
                "--label",
                &label_arg,
            ])
            .await?;
        let url = url.trim().to_string();
        let number = url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(ExternalItem {
            id: number,
            url,
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
        // Issue state carries the coarse status.
        match status {
            TaskStatus::Done => {
                self.run_gh(&[
                    "issue", "close", external_id, "--repo", &self.repo, "--reason", "completed",
                ])
                .await?;
            }
            TaskStatus::Cancelled => {
                self.run_gh(&[
                    "issue",
                    "close",
                    external_id,
                    "--repo",
                    &self.repo,
                    "--reason",
                    "not planned",
                ])
                .await?;
            }
            _ => {
                // Reopening an already-open issue fails; tolerate it.
                if let Err(e) = self
                    .run_gh(&["issue", "reopen", external_id, "--repo", &self.repo])
                    .await
                {
                    tracing::debug!(issue = external_id, error = %e, "issue reopen skipped");
                }
            }
        }

        self.set_board_status(&self.issue_url(external_id), status)
            .await
    }

    async fn add_labels(
        &self,
        external_id: &str,
        labels: &[String],
    ) -> Result<(), BackendError> {
        let label_arg = labels.join(",");
        self.run_gh(&[
            "issue",
            "edit",
            external_id,
            "--repo",
            &self.repo,
            "--add-label",
            &label_arg,
        ])
        .await?;
        Ok(())
    }

    async fn write_shared_state(
        &self,
        external_id: &str,
        state: &SharedState,
    ) -> Result<(), BackendError> {
        // Issues have no custom fields; the record travels as a marker
        // comment.
        self.add_comment(external_id, &state.to_comment()).await
    }

    async fn add_comment(&self, external_id: &str, body: &str) -> Result<(), BackendError> {
        self.run_gh(&[
            "issue",
            "comment",
            external_id,
            "--repo",
            &self.repo,
            "--body",
            body,
        ])
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Webhook signature verification
// ---------------------------------------------------------------------------

/// Verify a GitHub webhook delivery: HMAC-SHA256 over the raw body,
/// compared constant-time against `X-Hub-Signature-256: sha256=<hex>`.
pub fn verify_webhook_signature(secret: &[u8], body: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    // verify_slice is the constant-time comparison.
    mac.verify_slice(&expected).is_ok()
}

// ---------------------------------------------------------------------------
// gh output parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    state: String,
    url: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

fn parse_issue_list(raw: &str) -> Option<Vec<ExternalItem>> {
    let issues: Vec<GhIssue> = serde_json::from_str(raw).ok()?;
    Some(
        issues
            .into_iter()
            .map(|issue| {
                let status = match issue.state.to_ascii_uppercase().as_str() {
                    "CLOSED" => Some(TaskStatus::Done),
                    _ => Some(TaskStatus::Todo),
                };
                let shared_state = issue
                    .body
                    .as_deref()
                    .and_then(SharedState::from_comment);
                ExternalItem {
                    id: issue.number.to_string(),
                    url: issue.url,
                    title: issue.title,
                    status,
                    labels: issue.labels.into_iter().map(|l| l.name).collect(),
                    shared_state,
                }
            })
            .collect(),
    )
}

/// The project's Status single-select field with its option ids.
#[derive(Debug, Clone)]
struct StatusField {
    project_id: String,
    field_id: String,
    options: Vec<StatusOption>,
}

#[derive(Debug, Clone)]
struct StatusOption {
    id: String,
    name: String,
}

fn parse_status_field(raw: &str) -> Option<StatusField> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let fields = value.get("fields")?.as_array()?;
    let status = fields
        .iter()
        .find(|f| f.get("name").and_then(|n| n.as_str()) == Some("Status"))?;

    let options = status
        .get("options")?
        .as_array()?
        .iter()
        .filter_map(|o| {
            Some(StatusOption {
                id: o.get("id")?.as_str()?.to_string(),
                name: o.get("name")?.as_str()?.to_string(),
            })
        })
        .collect();

    Some(StatusField {
        project_id: value
            .get("projectId")
            .or_else(|| status.get("projectId"))
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string(),
        field_id: status.get("id")?.as_str()?.to_string(),
        options,
    })
}

#[derive(Debug, Clone)]
struct ProjectItem {
    id: String,
}

fn parse_project_item(raw: &str, issue_url: &str) -> Option<ProjectItem> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let items = value.get("items")?.as_array()?;
    items.iter().find_map(|item| {
        let content_url = item.get("content")?.get("url")?.as_str()?;
        if content_url == issue_url {
            Some(ProjectItem {
                id: item.get("id")?.as_str()?.to_string(),
            })
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_list_parsing() {
        let raw = r#"[
            {"number": 12, "title": "feat(api): add X", "state": "OPEN",
             "url": "https://github.com/o/r/issues/12",
             "labels": [{"name": "bosun"}, {"name": "bug"}], "body": null},
            {"number": 13, "title": "fix: y", "state": "CLOSED",
             "url": "https://github.com/o/r/issues/13", "labels": [], "body": ""}
        ]"#;
        let items = parse_issue_list(raw).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "12");
        assert_eq!(items[0].status, Some(TaskStatus::Todo));
        assert_eq!(items[0].labels, vec!["bosun".to_string(), "bug".to_string()]);
        assert_eq!(items[1].status, Some(TaskStatus::Done));
    }

    #[test]
    fn status_field_parsing() {
        let raw = r#"{
            "fields": [
                {"id": "F1", "name": "Title", "type": "ProjectV2Field"},
                {"id": "F2", "name": "Status", "type": "ProjectV2SingleSelectField",
                 "options": [
                    {"id": "o1", "name": "Todo"},
                    {"id": "o2", "name": "In Progress"},
                    {"id": "o3", "name": "Done"}
                 ]}
            ],
            "projectId": "P1"
        }"#;
        let field = parse_status_field(raw).unwrap();
        assert_eq!(field.field_id, "F2");
        assert_eq!(field.project_id, "P1");
        assert_eq!(field.options.len(), 3);
        assert_eq!(field.options[1].name, "In Progress");
    }

    #[test]
    fn project_item_lookup_by_content_url() {
        let raw = r#"{
            "items": [
                {"id": "I1", "content": {"url": "https://github.com/o/r/issues/7"}},
                {"id": "I2", "content": {"url": "https://github.com/o/r/issues/8"}}
            ]
        }"#;
        let item = parse_project_item(raw, "https://github.com/o/r/issues/8").unwrap();
        assert_eq!(item.id, "I2");
        assert!(parse_project_item(raw, "https://github.com/o/r/issues/9").is_none());
    }

    #[test]
    fn webhook_signature_accepts_valid() {
        let secret = b"s3cret";
        let body = br#"{"action":"opened"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");

        assert!(verify_webhook_signature(secret, body, &header));
    }

    #[test]
    fn webhook_signature_rejects_tampering() {
        let secret = b"s3cret";
        let body = br#"{"action":"opened"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");

        assert!(!verify_webhook_signature(secret, b"tampered", &header));
        assert!(!verify_webhook_signature(b"wrong-secret", body, &header));
        assert!(!verify_webhook_signature(secret, body, "sha256=deadbeef"));
        assert!(!verify_webhook_signature(secret, body, &digest));
        assert!(!verify_webhook_signature(secret, body, "sha256=nothex!"));
    }

    #[test]
    fn default_labels_are_enforced_constants() {
        assert_eq!(CANONICAL_LABEL, "bosun");
        assert_eq!(crate::kanban::LEGACY_LABEL, "codex-monitor");
    }
}
