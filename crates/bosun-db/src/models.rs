use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Outcome of a single task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failure,
    Cancelled,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for AttemptOutcome {
    type Err = AttemptOutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AttemptOutcomeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AttemptOutcome`] string.
#[derive(Debug, Clone)]
pub struct AttemptOutcomeParseError(pub String);

impl fmt::Display for AttemptOutcomeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid attempt outcome: {:?}", self.0)
    }
}

impl std::error::Error for AttemptOutcomeParseError {}

// ---------------------------------------------------------------------------

/// Why an attempt failed, when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The agent exceeded its wall-time limit.
    Timeout,
    /// The SDK reported a transient error (rate limit, overload).
    SdkTransient,
    /// The SDK reported a permanent error.
    SdkFatal,
    /// A git operation (commit, push) failed.
    GitFailure,
    /// A validation hook rejected the result.
    HookRejected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::SdkTransient => "sdk_transient",
            Self::SdkFatal => "sdk_fatal",
            Self::GitFailure => "git_failure",
            Self::HookRejected => "hook_rejected",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Kind of an entry in the append-only task event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskCreated,
    TaskUpdated,
    AttemptStarted,
    AttemptHeartbeat,
    AttemptCompleted,
    TaskStatusChanged,
    TaskArchived,
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::AttemptStarted => "attempt_started",
            Self::AttemptHeartbeat => "attempt_heartbeat",
            Self::AttemptCompleted => "attempt_completed",
            Self::TaskStatusChanged => "task_status_changed",
            Self::TaskArchived => "task_archived",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// External kanban backend identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum KanbanBackendKind {
    Github,
    Jira,
    VibeKanban,
}

impl fmt::Display for KanbanBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Github => "github",
            Self::Jira => "jira",
            Self::VibeKanban => "vibe_kanban",
        };
        f.write_str(s)
    }
}

impl FromStr for KanbanBackendKind {
    type Err = KanbanBackendParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "jira" => Ok(Self::Jira),
            "vibe_kanban" | "vk" => Ok(Self::VibeKanban),
            other => Err(KanbanBackendParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`KanbanBackendKind`] string.
#[derive(Debug, Clone)]
pub struct KanbanBackendParseError(pub String);

impl fmt::Display for KanbanBackendParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid kanban backend: {:?}", self.0)
    }
}

impl std::error::Error for KanbanBackendParseError {}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A task row (materialized view over the event log).
#[derive(Debug, Clone, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    /// Scope extracted from a conventional-commit title, e.g. "api" from
    /// "feat(api): add X".
    pub scope: Option<String>,
    pub status: TaskStatus,
    pub labels: Json<Vec<String>>,
    pub workspace_id: Option<String>,
    pub repo_ref: Option<String>,
    pub owner_id: Option<String>,
    pub attempt_token: Option<Uuid>,
    pub attempt_started: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub ignore_reason: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single attempt at executing a task.
#[derive(Debug, Clone, FromRow)]
pub struct TaskAttempt {
    /// The attempt token; globally unique.
    pub id: Uuid,
    pub task_id: Uuid,
    /// Identifier of the orchestrator instance that owns this attempt.
    pub owner_id: String,
    pub executor_profile: String,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    pub failure_kind: Option<String>,
}

/// One entry in the append-only event log.
#[derive(Debug, Clone, FromRow)]
pub struct TaskEventRow {
    pub id: i64,
    pub task_id: Uuid,
    /// Per-task sequence number, dense and strictly increasing.
    pub seq: i64,
    pub kind: TaskEventKind,
    pub payload: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Pairing between an internal task and its external kanban item.
#[derive(Debug, Clone, FromRow)]
pub struct KanbanMirror {
    pub task_id: Uuid,
    pub backend: KanbanBackendKind,
    pub external_id: String,
    pub external_url: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trip() {
        for s in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let text = s.to_string();
            assert_eq!(text.parse::<TaskStatus>().unwrap(), s);
        }
    }

    #[test]
    fn task_status_parse_rejects_unknown() {
        assert!("nope".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Todo.is_terminal());
    }

    #[test]
    fn backend_accepts_vk_alias() {
        assert_eq!(
            "vk".parse::<KanbanBackendKind>().unwrap(),
            KanbanBackendKind::VibeKanban
        );
        assert_eq!(
            "vibe_kanban".parse::<KanbanBackendKind>().unwrap(),
            KanbanBackendKind::VibeKanban
        );
    }
}
