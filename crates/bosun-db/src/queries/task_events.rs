//! Query functions for the append-only `task_events` log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{TaskEventKind, TaskEventRow};

/// Append an event to the log, assigning the next per-task sequence number.
///
/// SQLite serializes writers, so the `MAX(seq)+1` subquery cannot race
/// with a concurrent append for the same task.
pub async fn append_event(
    pool: &SqlitePool,
    task_id: Uuid,
    kind: TaskEventKind,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<TaskEventRow> {
    let event = sqlx::query_as::<_, TaskEventRow>(
        "INSERT INTO task_events (task_id, seq, kind, payload, created_at) \
         VALUES (?, \
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_events WHERE task_id = ?), \
                 ?, ?, ?) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(task_id)
    .bind(kind)
    .bind(Json(payload))
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to append task event")?;

    Ok(event)
}

/// List all events for one task in sequence order.
pub async fn list_events_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Vec<TaskEventRow>> {
    let events = sqlx::query_as::<_, TaskEventRow>(
        "SELECT * FROM task_events WHERE task_id = ? ORDER BY seq ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list task events")?;

    Ok(events)
}

/// List every event in the log in global insertion order, used for full
/// replays.
pub async fn list_all_events(pool: &SqlitePool) -> Result<Vec<TaskEventRow>> {
    let events =
        sqlx::query_as::<_, TaskEventRow>("SELECT * FROM task_events ORDER BY id ASC")
            .fetch_all(pool)
            .await
            .context("failed to list all task events")?;

    Ok(events)
}
