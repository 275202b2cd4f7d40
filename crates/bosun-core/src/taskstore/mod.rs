//! The internal task store: append-only event log with a materialized
//! view, guarded status transitions, and a broadcast event stream.
//!
//! The store is the source of truth under the default `internal-primary`
//! sync policy. Every mutation appends exactly one event; replaying the
//! log from scratch reproduces the same materialized state.

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use bosun_db::models::{
    AttemptOutcome, Task, TaskAttempt, TaskEventKind, TaskEventRow, TaskStatus,
};
use bosun_db::queries::{attempts, task_events, tasks};

use crate::router::parse_scope;

/// Capacity of the broadcast channel feeding observers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// The task already has a pending attempt; a second one is rejected.
    #[error("task {task_id} already has an active attempt")]
    AttemptAlreadyActive { task_id: Uuid },

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("attempt {0} not found")]
    AttemptNotFound(Uuid),

    /// The task's status changed underneath the caller.
    #[error("optimistic lock failed for task {task_id}: status is no longer {expected}")]
    StaleStatus {
        task_id: Uuid,
        expected: TaskStatus,
    },

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// An event delivered to observers. Listeners observe only; they never
/// mutate orchestrator state.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskCreated {
        task_id: Uuid,
        title: String,
    },
    TaskUpdated {
        task_id: Uuid,
    },
    AttemptStarted {
        task_id: Uuid,
        attempt_token: Uuid,
        executor_profile: String,
    },
    AttemptHeartbeat {
        task_id: Uuid,
        attempt_token: Uuid,
    },
    AttemptCompleted {
        task_id: Uuid,
        attempt_token: Uuid,
        outcome: AttemptOutcome,
    },
    TaskStatusChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskArchived {
        task_id: Uuid,
    },
}

/// Whether `from -> to` is an edge of the status graph:
///
/// ```text
/// todo        -> in_progress | cancelled
/// in_progress -> in_review | done | failed | cancelled
/// in_review   -> done | failed | cancelled
/// failed      -> in_progress | cancelled       (retry)
/// done        -> (terminal)
/// cancelled   -> (terminal)
/// ```
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Todo, InProgress)
            | (Todo, Cancelled)
            | (InProgress, InReview)
            | (InProgress, Done)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (InReview, Done)
            | (InReview, Failed)
            | (InReview, Cancelled)
            | (Failed, InProgress)
            | (Failed, Cancelled)
    )
}

/// The internal task store.
pub struct TaskStore {
    pool: SqlitePool,
    /// Identifier of this orchestrator instance, recorded on attempts.
    owner_id: String,
    events_tx: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    pub fn new(pool: SqlitePool, owner_id: impl Into<String>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            owner_id: owner_id.into(),
            events_tx,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribe to the observer event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events_tx.subscribe()
    }

    /// The event stream as a `futures::Stream`, dropping events the
    /// subscriber could not keep up with.
    pub fn event_stream(&self) -> impl Stream<Item = TaskEvent> + Send + use<> {
        BroadcastStream::new(self.subscribe()).filter_map(|item| async move { item.ok() })
    }

    fn emit(&self, event: TaskEvent) {
        // No receivers is fine; events are observational.
        let _ = self.events_tx.send(event);
    }

    // -------------------------------------------------------------------
    // Task CRUD
    // -------------------------------------------------------------------

    /// Create a task. The scope is derived from the conventional-commit
    /// title when present.
    pub async fn create_task(
        &self,
        title: &str,
        labels: &[String],
        workspace_id: Option<&str>,
        repo_ref: Option<&str>,
    ) -> Result<Task, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let scope = parse_scope(title);

        let task = tasks::insert_task(
            &self.pool,
            id,
            title,
            scope,
            labels,
            workspace_id,
            repo_ref,
            now,
        )
        .await?;

        task_events::append_event(
            &self.pool,
            id,
            TaskEventKind::TaskCreated,
            json!({ "title": title, "labels": labels }),
            now,
        )
        .await?;

        self.emit(TaskEvent::TaskCreated {
            task_id: id,
            title: title.to_string(),
        });
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        tasks::get_task(&self.pool, id)
            .await?
            .ok_or(StoreError::TaskNotFound(id))
    }

    pub async fn list_tasks(&self, include_archived: bool) -> Result<Vec<Task>, StoreError> {
        Ok(tasks::list_tasks(&self.pool, include_archived).await?)
    }

    /// Tasks the supervisor may dispatch: `todo` (fresh) or `failed`
    /// (retry), with no pending attempt and no ignore reason.
    pub async fn list_ready(&self) -> Result<Vec<Task>, StoreError> {
        let mut ready = Vec::new();
        for status in [TaskStatus::Todo, TaskStatus::Failed] {
            for task in tasks::list_tasks_with_status(&self.pool, status).await? {
                if task.ignore_reason.is_some() {
                    continue;
                }
                let latest = attempts::latest_attempt_for_task(&self.pool, task.id).await?;
                if latest
                    .map(|a| a.outcome == AttemptOutcome::Pending)
                    .unwrap_or(false)
                {
                    continue;
                }
                ready.push(task);
            }
        }
        Ok(ready)
    }

    /// Update title/labels; the scope is re-derived from the new title.
    pub async fn update_task(
        &self,
        id: Uuid,
        title: &str,
        labels: &[String],
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let rows =
            tasks::update_task(&self.pool, id, title, parse_scope(title), labels, now).await?;
        if rows == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        task_events::append_event(
            &self.pool,
            id,
            TaskEventKind::TaskUpdated,
            json!({ "title": title, "labels": labels }),
            now,
        )
        .await?;
        self.emit(TaskEvent::TaskUpdated { task_id: id });
        Ok(())
    }

    // -------------------------------------------------------------------
    // Status transitions
    // -------------------------------------------------------------------

    /// Execute a guarded status transition and record the event.
    pub async fn change_status(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<(), StoreError> {
        if !is_valid_transition(from, to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        let now = Utc::now();
        let rows = tasks::transition_task_status(&self.pool, id, from, to, now).await?;
        if rows == 0 {
            // Distinguish a missing task from a stale status.
            return match tasks::get_task(&self.pool, id).await? {
                None => Err(StoreError::TaskNotFound(id)),
                Some(_) => Err(StoreError::StaleStatus {
                    task_id: id,
                    expected: from,
                }),
            };
        }

        task_events::append_event(
            &self.pool,
            id,
            TaskEventKind::TaskStatusChanged,
            json!({ "from": from, "to": to }),
            now,
        )
        .await?;
        self.emit(TaskEvent::TaskStatusChanged {
            task_id: id,
            from,
            to,
        });
        Ok(())
    }

    // -------------------------------------------------------------------
    // Attempts
    // -------------------------------------------------------------------

    /// Start a new attempt with a fresh token.
    ///
    /// Rejected when the latest attempt is still pending (at most one
    /// active attempt per task). Moves the task to `in_progress` and
    /// writes the shared-state snapshot.
    pub async fn start_attempt(
        &self,
        task_id: Uuid,
        executor_profile: &str,
        branch_name: Option<&str>,
        worktree_path: Option<&str>,
    ) -> Result<TaskAttempt, StoreError> {
        let task = self.get_task(task_id).await?;

        if let Some(latest) = attempts::latest_attempt_for_task(&self.pool, task_id).await? {
            if latest.outcome == AttemptOutcome::Pending {
                return Err(StoreError::AttemptAlreadyActive { task_id });
            }
        }

        if !is_valid_transition(task.status, TaskStatus::InProgress) {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }

        let token = Uuid::new_v4();
        let now = Utc::now();
        let attempt = attempts::insert_attempt(
            &self.pool,
            token,
            task_id,
            &self.owner_id,
            executor_profile,
            branch_name,
            worktree_path,
            now,
        )
        .await?;

        self.change_status(task_id, task.status, TaskStatus::InProgress)
            .await?;

        tasks::set_shared_state(
            &self.pool,
            task_id,
            Some(&self.owner_id),
            Some(token),
            Some(now),
            Some(now),
            task.retry_count,
            None,
            now,
        )
        .await?;

        task_events::append_event(
            &self.pool,
            task_id,
            TaskEventKind::AttemptStarted,
            json!({
                "attempt_token": token,
                "owner_id": self.owner_id,
                "executor_profile": executor_profile,
            }),
            now,
        )
        .await?;

        self.emit(TaskEvent::AttemptStarted {
            task_id,
            attempt_token: token,
            executor_profile: executor_profile.to_string(),
        });
        Ok(attempt)
    }

    /// Record a heartbeat for a pending attempt.
    pub async fn heartbeat(&self, attempt_token: Uuid) -> Result<(), StoreError> {
        let attempt = attempts::get_attempt(&self.pool, attempt_token)
            .await?
            .ok_or(StoreError::AttemptNotFound(attempt_token))?;

        let now = Utc::now();
        attempts::record_heartbeat(&self.pool, attempt_token, now).await?;
        tasks::touch_heartbeat(&self.pool, attempt.task_id, now).await?;
        task_events::append_event(
            &self.pool,
            attempt.task_id,
            TaskEventKind::AttemptHeartbeat,
            json!({ "attempt_token": attempt_token }),
            now,
        )
        .await?;
        self.emit(TaskEvent::AttemptHeartbeat {
            task_id: attempt.task_id,
            attempt_token,
        });
        Ok(())
    }

    /// Complete the attempt and move its task to `to_status`.
    ///
    /// On failure the task's retry counter is incremented in shared
    /// state; `failure_kind` records why.
    pub async fn complete_attempt(
        &self,
        attempt_token: Uuid,
        outcome: AttemptOutcome,
        failure_kind: Option<&str>,
        to_status: TaskStatus,
    ) -> Result<(), StoreError> {
        let attempt = attempts::get_attempt(&self.pool, attempt_token)
            .await?
            .ok_or(StoreError::AttemptNotFound(attempt_token))?;
        let task = self.get_task(attempt.task_id).await?;

        if !is_valid_transition(task.status, to_status) {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: to_status,
            });
        }

        let now = Utc::now();
        attempts::complete_attempt(&self.pool, attempt_token, outcome, failure_kind, now)
            .await?;

        self.change_status(attempt.task_id, task.status, to_status)
            .await?;

        let retry_count = if outcome == AttemptOutcome::Failure {
            task.retry_count + 1
        } else {
            task.retry_count
        };
        tasks::set_shared_state(
            &self.pool,
            attempt.task_id,
            Some(&self.owner_id),
            Some(attempt_token),
            Some(attempt.started_at),
            Some(now),
            retry_count,
            task.ignore_reason.as_deref(),
            now,
        )
        .await?;

        task_events::append_event(
            &self.pool,
            attempt.task_id,
            TaskEventKind::AttemptCompleted,
            json!({
                "attempt_token": attempt_token,
                "outcome": outcome,
                "failure_kind": failure_kind,
            }),
            now,
        )
        .await?;
        self.emit(TaskEvent::AttemptCompleted {
            task_id: attempt.task_id,
            attempt_token,
            outcome,
        });
        Ok(())
    }

    /// Cancel a task: completes any pending attempt as cancelled, then
    /// transitions the task to `cancelled`.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let task = self.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }

        let now = Utc::now();
        if let Some(latest) = attempts::latest_attempt_for_task(&self.pool, task_id).await? {
            if latest.outcome == AttemptOutcome::Pending {
                attempts::complete_attempt(
                    &self.pool,
                    latest.id,
                    AttemptOutcome::Cancelled,
                    None,
                    now,
                )
                .await?;
                task_events::append_event(
                    &self.pool,
                    task_id,
                    TaskEventKind::AttemptCompleted,
                    json!({ "attempt_token": latest.id, "outcome": AttemptOutcome::Cancelled }),
                    now,
                )
                .await?;
            }
        }

        self.change_status(task_id, task.status, TaskStatus::Cancelled)
            .await
    }

    /// Make a failed task eligible for dispatch again by clearing its
    /// ignore reason and shared-state failure bookkeeping.
    pub async fn retry_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }

        let now = Utc::now();
        tasks::set_shared_state(
            &self.pool,
            task_id,
            task.owner_id.as_deref(),
            task.attempt_token,
            task.attempt_started,
            task.heartbeat,
            task.retry_count,
            None,
            now,
        )
        .await?;
        task_events::append_event(
            &self.pool,
            task_id,
            TaskEventKind::TaskUpdated,
            json!({ "retry_requested": true }),
            now,
        )
        .await?;
        self.emit(TaskEvent::TaskUpdated { task_id });
        Ok(())
    }

    /// Mark a task as ignored by the dispatcher, with a reason that is
    /// mirrored to the external backend.
    pub async fn ignore_task(&self, task_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let task = self.get_task(task_id).await?;
        let now = Utc::now();
        tasks::set_shared_state(
            &self.pool,
            task_id,
            task.owner_id.as_deref(),
            task.attempt_token,
            task.attempt_started,
            task.heartbeat,
            task.retry_count,
            Some(reason),
            now,
        )
        .await?;
        task_events::append_event(
            &self.pool,
            task_id,
            TaskEventKind::TaskUpdated,
            json!({ "ignore_reason": reason }),
            now,
        )
        .await?;
        self.emit(TaskEvent::TaskUpdated { task_id });
        Ok(())
    }

    /// Archive terminal tasks last touched before `cutoff`.
    pub async fn archive_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let archived = tasks::archive_tasks_older_than(&self.pool, cutoff, now).await?;
        for &task_id in &archived {
            task_events::append_event(
                &self.pool,
                task_id,
                TaskEventKind::TaskArchived,
                json!({}),
                now,
            )
            .await?;
            self.emit(TaskEvent::TaskArchived { task_id });
        }
        Ok(archived)
    }

    /// The raw event log for one task.
    pub async fn events_for_task(&self, task_id: Uuid) -> Result<Vec<TaskEventRow>, StoreError> {
        Ok(task_events::list_events_for_task(&self.pool, task_id).await?)
    }

    /// The latest attempt for a task.
    pub async fn latest_attempt(
        &self,
        task_id: Uuid,
    ) -> Result<Option<TaskAttempt>, StoreError> {
        Ok(attempts::latest_attempt_for_task(&self.pool, task_id).await?)
    }
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

/// State of one task folded from its event log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializedTask {
    pub title: String,
    pub labels: Vec<String>,
    pub status: Option<TaskStatus>,
    pub attempt_count: u64,
    pub active_attempt: Option<Uuid>,
    pub archived: bool,
}

/// Fold an ordered event log into the task's materialized state.
///
/// Pure and deterministic: the same log always yields the same state,
/// and replaying a log twice is indistinguishable from replaying it
/// once.
pub fn materialize(events: &[TaskEventRow]) -> MaterializedTask {
    let mut state = MaterializedTask::default();

    for event in events {
        let payload = &event.payload.0;
        match event.kind {
            TaskEventKind::TaskCreated => {
                if let Some(title) = payload.get("title").and_then(|t| t.as_str()) {
                    state.title = title.to_string();
                }
                if let Some(labels) = payload.get("labels").and_then(|l| l.as_array()) {
                    state.labels = labels
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect();
                }
                state.status = Some(TaskStatus::Todo);
            }
            TaskEventKind::TaskUpdated => {
                if let Some(title) = payload.get("title").and_then(|t| t.as_str()) {
                    state.title = title.to_string();
                }
                if let Some(labels) = payload.get("labels").and_then(|l| l.as_array()) {
                    state.labels = labels
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect();
                }
            }
            TaskEventKind::AttemptStarted => {
                state.attempt_count += 1;
                state.active_attempt = payload
                    .get("attempt_token")
                    .and_then(|t| t.as_str())
                    .and_then(|t| Uuid::parse_str(t).ok());
            }
            TaskEventKind::AttemptHeartbeat => {}
            TaskEventKind::AttemptCompleted => {
                state.active_attempt = None;
            }
            TaskEventKind::TaskStatusChanged => {
                if let Some(to) = payload
                    .get("to")
                    .and_then(|t| t.as_str())
                    .and_then(|t| t.parse::<TaskStatus>().ok())
                {
                    state.status = Some(to);
                }
            }
            TaskEventKind::TaskArchived => {
                state.archived = true;
            }
        }
    }

    state
}

/// Replay the full log and materialize every task, for consistency
/// checks and recovery.
pub async fn replay_all(pool: &SqlitePool) -> anyhow::Result<Vec<(Uuid, MaterializedTask)>> {
    let events = task_events::list_all_events(pool)
        .await
        .context("failed to load event log")?;

    let mut by_task: Vec<(Uuid, Vec<TaskEventRow>)> = Vec::new();
    for event in events {
        match by_task.iter_mut().find(|(id, _)| *id == event.task_id) {
            Some((_, list)) => list.push(event),
            None => by_task.push((event.task_id, vec![event])),
        }
    }

    Ok(by_task
        .into_iter()
        .map(|(id, events)| (id, materialize(&events)))
        .collect())
}
