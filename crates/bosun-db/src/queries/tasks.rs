//! Query functions for the `tasks` table (the materialized task view).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row. The caller supplies the id so the same UUID can
/// be threaded through the event log.
pub async fn insert_task(
    pool: &SqlitePool,
    id: Uuid,
    title: &str,
    scope: Option<&str>,
    labels: &[String],
    workspace_id: Option<&str>,
    repo_ref: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, title, scope, labels, workspace_id, repo_ref, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(title)
    .bind(scope)
    .bind(Json(labels.to_vec()))
    .bind(workspace_id)
    .bind(repo_ref)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks, optionally including archived ones, ordered by creation time.
pub async fn list_tasks(pool: &SqlitePool, include_archived: bool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE archived = 0 OR ? ORDER BY created_at ASC",
    )
    .bind(include_archived)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// List non-archived tasks with the given status.
pub async fn list_tasks_with_status(
    pool: &SqlitePool,
    status: TaskStatus,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = ? AND archived = 0 ORDER BY created_at ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by status")?;

    Ok(tasks)
}

/// Transition a task's status with an optimistic guard on the current
/// status. Returns the number of rows affected (0 means the guard failed
/// or the task does not exist).
pub async fn transition_task_status(
    pool: &SqlitePool,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Update the mutable task fields (title, scope, labels).
pub async fn update_task(
    pool: &SqlitePool,
    id: Uuid,
    title: &str,
    scope: Option<&str>,
    labels: &[String],
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET title = ?, scope = ?, labels = ?, updated_at = ? WHERE id = ?",
    )
    .bind(title)
    .bind(scope)
    .bind(Json(labels.to_vec()))
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task")?;

    Ok(result.rows_affected())
}

/// Write the shared-state snapshot for the active attempt.
#[allow(clippy::too_many_arguments)]
pub async fn set_shared_state(
    pool: &SqlitePool,
    id: Uuid,
    owner_id: Option<&str>,
    attempt_token: Option<Uuid>,
    attempt_started: Option<DateTime<Utc>>,
    heartbeat: Option<DateTime<Utc>>,
    retry_count: i64,
    ignore_reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET owner_id = ?, attempt_token = ?, attempt_started = ?, \
         heartbeat = ?, retry_count = ?, ignore_reason = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(owner_id)
    .bind(attempt_token)
    .bind(attempt_started)
    .bind(heartbeat)
    .bind(retry_count)
    .bind(ignore_reason)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update shared state")?;

    Ok(result.rows_affected())
}

/// Record a heartbeat on the task's shared-state snapshot.
pub async fn touch_heartbeat(pool: &SqlitePool, id: Uuid, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET heartbeat = ?, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record heartbeat")?;

    Ok(result.rows_affected())
}

/// Mark terminal tasks last touched before `cutoff` as archived.
///
/// Returns the ids of the tasks that were archived by this call.
pub async fn archive_tasks_older_than(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM tasks \
         WHERE archived = 0 AND status IN ('done', 'cancelled') AND updated_at < ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to select archivable tasks")?;

    for (id,) in &ids {
        sqlx::query("UPDATE tasks SET archived = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .context("failed to archive task")?;
    }

    Ok(ids.into_iter().map(|(id,)| id).collect())
}
