//! Query functions for the `task_attempts` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{AttemptOutcome, TaskAttempt};

/// Insert a new attempt. The id is the attempt token; the unique index on
/// `(owner_id, id)` enforces global attempt-token uniqueness.
pub async fn insert_attempt(
    pool: &SqlitePool,
    token: Uuid,
    task_id: Uuid,
    owner_id: &str,
    executor_profile: &str,
    branch_name: Option<&str>,
    worktree_path: Option<&str>,
    started_at: DateTime<Utc>,
) -> Result<TaskAttempt> {
    let attempt = sqlx::query_as::<_, TaskAttempt>(
        "INSERT INTO task_attempts \
         (id, task_id, owner_id, executor_profile, branch_name, worktree_path, started_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(token)
    .bind(task_id)
    .bind(owner_id)
    .bind(executor_profile)
    .bind(branch_name)
    .bind(worktree_path)
    .bind(started_at)
    .fetch_one(pool)
    .await
    .context("failed to insert attempt")?;

    Ok(attempt)
}

/// Fetch an attempt by its token.
pub async fn get_attempt(pool: &SqlitePool, token: Uuid) -> Result<Option<TaskAttempt>> {
    let attempt =
        sqlx::query_as::<_, TaskAttempt>("SELECT * FROM task_attempts WHERE id = ?")
            .bind(token)
            .fetch_optional(pool)
            .await
            .context("failed to fetch attempt")?;

    Ok(attempt)
}

/// Return the most recently started attempt for a task, if any.
pub async fn latest_attempt_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Option<TaskAttempt>> {
    let attempt = sqlx::query_as::<_, TaskAttempt>(
        "SELECT * FROM task_attempts WHERE task_id = ? \
         ORDER BY started_at DESC, id DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest attempt")?;

    Ok(attempt)
}

/// List all attempts for a task, oldest first.
pub async fn list_attempts_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Vec<TaskAttempt>> {
    let attempts = sqlx::query_as::<_, TaskAttempt>(
        "SELECT * FROM task_attempts WHERE task_id = ? ORDER BY started_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list attempts")?;

    Ok(attempts)
}

/// Record the branch and worktree allocated for an attempt.
pub async fn set_workspace(
    pool: &SqlitePool,
    token: Uuid,
    branch_name: &str,
    worktree_path: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_attempts SET branch_name = ?, worktree_path = ? WHERE id = ?",
    )
    .bind(branch_name)
    .bind(worktree_path)
    .bind(token)
    .execute(pool)
    .await
    .context("failed to set attempt workspace")?;

    Ok(result.rows_affected())
}

/// Record a heartbeat on a pending attempt.
pub async fn record_heartbeat(
    pool: &SqlitePool,
    token: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_attempts SET heartbeat_at = ? WHERE id = ? AND outcome = 'pending'",
    )
    .bind(now)
    .bind(token)
    .execute(pool)
    .await
    .context("failed to record attempt heartbeat")?;

    Ok(result.rows_affected())
}

/// Complete an attempt with the given outcome. Guarded on `pending` so a
/// replayed completion is a no-op (returns 0 rows).
pub async fn complete_attempt(
    pool: &SqlitePool,
    token: Uuid,
    outcome: AttemptOutcome,
    failure_kind: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_attempts SET outcome = ?, failure_kind = ?, completed_at = ? \
         WHERE id = ? AND outcome = 'pending'",
    )
    .bind(outcome)
    .bind(failure_kind)
    .bind(now)
    .bind(token)
    .execute(pool)
    .await
    .context("failed to complete attempt")?;

    Ok(result.rows_affected())
}
