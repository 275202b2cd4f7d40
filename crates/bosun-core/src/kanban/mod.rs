//! Kanban synchronization between the internal task store and exactly
//! one external backend (GitHub Issues+Projects, Jira, or Vibe-Kanban).
//!
//! The internal store is the source of truth under the default
//! `internal-primary` policy: external status edits are ignored, and
//! external body edits never overwrite internal state. Under
//! `bidirectional`, external status changes drive internal transitions
//! through the status graph. Every outbound write is keyed by the
//! current attempt token so replays cannot duplicate comments or
//! re-open closed items.

pub mod github;
pub mod jira;
pub mod shared_state;
pub mod status_map;
pub mod vk;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use bosun_db::models::{KanbanBackendKind, Task, TaskStatus};
use bosun_db::queries::mirrors;

use crate::taskstore::{TaskStore, is_valid_transition};
pub use shared_state::SharedState;

/// Canonical label carried by every synced external item.
pub const CANONICAL_LABEL: &str = "bosun";

/// Legacy alias label, kept for older tooling.
pub const LEGACY_LABEL: &str = "codex-monitor";

/// Direction of truth between the internal store and the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPolicy {
    /// External mirrors internal; external status edits are ignored.
    #[default]
    InternalPrimary,
    /// External status changes drive internal status.
    Bidirectional,
}

/// Errors from backend interactions.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend cannot be reached; the next sweep retries.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Credentials are missing or expired; surfaced with a remediation
    /// hint (e.g. `gh auth login`).
    #[error("backend authentication missing: {hint}")]
    AuthMissing { hint: String },

    /// The backend answered with something we cannot work with.
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

/// One item as seen on the external board.
#[derive(Debug, Clone)]
pub struct ExternalItem {
    pub id: String,
    pub url: String,
    pub title: String,
    /// The backend's status translated into the internal vocabulary,
    /// when the backend exposes one.
    pub status: Option<TaskStatus>,
    pub labels: Vec<String>,
    pub shared_state: Option<SharedState>,
}

/// Adapter interface for one external kanban backend.
#[async_trait]
pub trait KanbanBackend: Send + Sync {
    fn kind(&self) -> KanbanBackendKind;

    /// Fetch all items carrying the canonical label.
    async fn fetch_items(&self) -> Result<Vec<ExternalItem>, BackendError>;

    /// Create the external mirror item for a task.
    async fn create_item(
        &self,
        title: &str,
        labels: &[String],
    ) -> Result<ExternalItem, BackendError>;

    /// Move an external item to the given status.
    async fn update_status(
        &self,
        external_id: &str,
        status: TaskStatus,
    ) -> Result<(), BackendError>;

    /// Add labels to an item. Backends merge, never replace.
    async fn add_labels(&self, external_id: &str, labels: &[String])
    -> Result<(), BackendError>;

    /// Write the shared-state record onto the item.
    async fn write_shared_state(
        &self,
        external_id: &str,
        state: &SharedState,
    ) -> Result<(), BackendError>;

    /// Post a comment on the item.
    async fn add_comment(&self, external_id: &str, body: &str) -> Result<(), BackendError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn KanbanBackend) {}
};

/// Merge required labels into an existing set, preserving order and
/// deduplicating. The result always contains the canonical and legacy
/// labels.
pub fn merge_labels(existing: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(existing.len() + extra.len() + 2);
    for label in existing
        .iter()
        .chain(extra.iter())
        .map(|s| s.as_str())
        .chain([CANONICAL_LABEL, LEGACY_LABEL])
    {
        if !merged.iter().any(|l| l == label) {
            merged.push(label.to_string());
        }
    }
    merged
}

/// Summary of one sync pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub imported: u64,
    pub status_applied: u64,
    pub status_ignored: u64,
    pub pushed: u64,
}

/// The mapper between the internal store and one backend.
pub struct KanbanSync {
    pool: SqlitePool,
    backend: Arc<dyn KanbanBackend>,
    policy: SyncPolicy,
}

impl KanbanSync {
    pub fn new(pool: SqlitePool, backend: Arc<dyn KanbanBackend>, policy: SyncPolicy) -> Self {
        Self {
            pool,
            backend,
            policy,
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn backend_kind(&self) -> KanbanBackendKind {
        self.backend.kind()
    }

    /// Pull external items into the store.
    ///
    /// Unmirrored items carrying the canonical label become new internal
    /// tasks. For mirrored items, external label additions are observed
    /// (merged); status edits are applied only under `bidirectional` and
    /// only along valid transitions.
    pub async fn pull(&self, store: &TaskStore) -> Result<SyncSummary, BackendError> {
        let mut summary = SyncSummary::default();
        let items = self.backend.fetch_items().await?;

        for item in items {
            let mirror = mirrors::find_by_external_id(&self.pool, self.backend.kind(), &item.id)
                .await
                .map_err(|e| BackendError::Protocol(e.to_string()))?;

            match mirror {
                None => {
                    let labels = merge_labels(&item.labels, &[]);
                    let task = store
                        .create_task(&item.title, &labels, None, None)
                        .await
                        .map_err(|e| BackendError::Protocol(e.to_string()))?;
                    mirrors::upsert_mirror(
                        &self.pool,
                        task.id,
                        self.backend.kind(),
                        &item.id,
                        &item.url,
                        Utc::now(),
                    )
                    .await
                    .map_err(|e| BackendError::Protocol(e.to_string()))?;
                    summary.imported += 1;
                }
                Some(mirror) => {
                    let task = store
                        .get_task(mirror.task_id)
                        .await
                        .map_err(|e| BackendError::Protocol(e.to_string()))?;

                    // Label additions are observed regardless of policy.
                    let merged = merge_labels(&task.labels.0, &item.labels);
                    if merged != task.labels.0 {
                        store
                            .update_task(task.id, &task.title, &merged)
                            .await
                            .map_err(|e| BackendError::Protocol(e.to_string()))?;
                    }

                    if let Some(external_status) = item.status {
                        if external_status == task.status {
                            continue;
                        }
                        match self.policy {
                            SyncPolicy::InternalPrimary => {
                                tracing::debug!(
                                    task_id = %task.id,
                                    external = %external_status,
                                    internal = %task.status,
                                    "ignoring external status edit under internal-primary"
                                );
                                summary.status_ignored += 1;
                            }
                            SyncPolicy::Bidirectional => {
                                if is_valid_transition(task.status, external_status) {
                                    store
                                        .change_status(task.id, task.status, external_status)
                                        .await
                                        .map_err(|e| BackendError::Protocol(e.to_string()))?;
                                    summary.status_applied += 1;
                                } else {
                                    tracing::warn!(
                                        task_id = %task.id,
                                        external = %external_status,
                                        internal = %task.status,
                                        "external status edit is not a valid transition, ignoring"
                                    );
                                    summary.status_ignored += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Mirror one task outward: ensure the external item exists, enforce
    /// labels, and write status plus shared state.
    ///
    /// Writes are at-most-once per `(task, attempt token, kind)`: a
    /// replay of the same attempt is a no-op.
    pub async fn push_task(&self, task: &Task) -> Result<(), BackendError> {
        let now = Utc::now();
        let mirror = mirrors::get_mirror(&self.pool, task.id)
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))?;

        let labels = merge_labels(&task.labels.0, &[]);
        let external_id = match mirror {
            Some(m) => m.external_id,
            None => {
                let item = self.backend.create_item(&task.title, &labels).await?;
                mirrors::upsert_mirror(
                    &self.pool,
                    task.id,
                    self.backend.kind(),
                    &item.id,
                    &item.url,
                    now,
                )
                .await
                .map_err(|e| BackendError::Protocol(e.to_string()))?;
                item.id
            }
        };

        self.backend.add_labels(&external_id, &labels).await?;

        // The correlation id for idempotency is the current attempt
        // token; tasks that have never run use the nil token.
        let token = task.attempt_token.unwrap_or(Uuid::nil());

        let status_kind = format!("status:{}", task.status);
        if self.claim(task.id, token, &status_kind).await? {
            self.backend.update_status(&external_id, task.status).await?;
        }

        let state = SharedState {
            owner_id: task.owner_id.clone(),
            attempt_token: task.attempt_token,
            attempt_started: task.attempt_started,
            heartbeat: task.heartbeat,
            retry_count: task.retry_count,
            ignore_reason: task.ignore_reason.clone(),
        };
        self.backend.write_shared_state(&external_id, &state).await?;

        Ok(())
    }

    /// Post a comment at most once per `(task, attempt, kind)`.
    pub async fn comment_once(
        &self,
        task: &Task,
        kind: &str,
        body: &str,
    ) -> Result<bool, BackendError> {
        let Some(mirror) = mirrors::get_mirror(&self.pool, task.id)
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))?
        else {
            return Ok(false);
        };

        let token = task.attempt_token.unwrap_or(Uuid::nil());
        let kind = format!("comment:{kind}");
        if !self.claim(task.id, token, &kind).await? {
            return Ok(false);
        }
        self.backend.add_comment(&mirror.external_id, body).await?;
        Ok(true)
    }

    async fn claim(&self, task_id: Uuid, token: Uuid, kind: &str) -> Result<bool, BackendError> {
        mirrors::claim_sync_write(&self.pool, task_id, token, kind, Utc::now())
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))
    }
}
