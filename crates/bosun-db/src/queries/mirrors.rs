//! Query functions for the `kanban_mirrors` table and the outbound-write
//! idempotency ledger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{KanbanBackendKind, KanbanMirror};

/// Record (or replace) the external mirror for a task.
pub async fn upsert_mirror(
    pool: &SqlitePool,
    task_id: Uuid,
    backend: KanbanBackendKind,
    external_id: &str,
    external_url: &str,
    now: DateTime<Utc>,
) -> Result<KanbanMirror> {
    let mirror = sqlx::query_as::<_, KanbanMirror>(
        "INSERT INTO kanban_mirrors (task_id, backend, external_id, external_url, created_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (task_id) DO UPDATE SET \
            backend = excluded.backend, \
            external_id = excluded.external_id, \
            external_url = excluded.external_url \
         RETURNING *",
    )
    .bind(task_id)
    .bind(backend)
    .bind(external_id)
    .bind(external_url)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to upsert kanban mirror")?;

    Ok(mirror)
}

/// Fetch the mirror for a task, if one exists.
pub async fn get_mirror(pool: &SqlitePool, task_id: Uuid) -> Result<Option<KanbanMirror>> {
    let mirror =
        sqlx::query_as::<_, KanbanMirror>("SELECT * FROM kanban_mirrors WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch kanban mirror")?;

    Ok(mirror)
}

/// Find the internal task mirrored by an external item.
pub async fn find_by_external_id(
    pool: &SqlitePool,
    backend: KanbanBackendKind,
    external_id: &str,
) -> Result<Option<KanbanMirror>> {
    let mirror = sqlx::query_as::<_, KanbanMirror>(
        "SELECT * FROM kanban_mirrors WHERE backend = ? AND external_id = ?",
    )
    .bind(backend)
    .bind(external_id)
    .fetch_optional(pool)
    .await
    .context("failed to look up mirror by external id")?;

    Ok(mirror)
}

/// Claim an outbound write slot for `(task, attempt_token, kind)`.
///
/// Returns `true` if this is the first time the write is attempted and
/// `false` if an identical write was already recorded -- the caller must
/// then skip the backend call entirely.
pub async fn claim_sync_write(
    pool: &SqlitePool,
    task_id: Uuid,
    attempt_token: Uuid,
    kind: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO sync_writes (task_id, attempt_token, kind, written_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(attempt_token)
    .bind(kind)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to claim sync write")?;

    Ok(result.rows_affected() > 0)
}
