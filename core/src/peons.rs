use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tracing::warn;

use crate::types::*;

/// What a stale-worker sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub peons_marked_offline: u64,
    pub tasks_failed: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.peons_marked_offline == 0 && self.tasks_failed == 0
    }
}

/// Upsert the worker's row. Also counts as a heartbeat.
pub async fn publish_state(pool: &PgPool, state: &WorkerState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO peon (id, status, current_task, queues, last_heartbeat)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (id)
        DO UPDATE SET
            status = EXCLUDED.status,
            current_task = EXCLUDED.current_task,
            queues = EXCLUDED.queues,
            last_heartbeat = NOW()
        "#,
    )
    .bind(&state.id)
    .bind(state.status)
    .bind(&state.current_task)
    .bind(&state.queues)
    .execute(pool)
    .await
    .with_context(|| format!("Failed to publish state for worker {}", state.id))?;

    Ok(())
}

/// Refresh `last_heartbeat` without touching status.
///
/// Returns false when the row is gone or already OFFLINE.
pub async fn touch_heartbeat(pool: &PgPool, worker_id: &str) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE peon
        SET last_heartbeat = NOW()
        WHERE id = $1
          AND status <> 'OFFLINE'
        "#,
    )
    .bind(worker_id)
    .execute(pool)
    .await
    .context("Failed to update heartbeat")?;

    Ok(updated.rows_affected() > 0)
}

/// Recover from workers that died without saying so.
///
/// Peons whose heartbeat is older than `stale_after` are marked OFFLINE. Then
/// every RUNNING task untouched for `stale_after` whose owner has no live
/// peon row (missing, OFFLINE, or stale) is failed with a diagnostic. The
/// failure counts as an attempt, so retry-enabled tasks become claimable
/// again while the retry budget lasts.
pub async fn reclaim_stale_tasks(pool: &PgPool, stale_after: Duration) -> Result<SweepReport> {
    let stale_after =
        chrono::Duration::from_std(stale_after).context("Stale threshold out of range")?;
    let cutoff = Utc::now() - stale_after;

    let mut tx = pool.begin().await.context("Failed to begin sweep")?;

    let stale: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE peon
        SET status = 'OFFLINE',
            current_task = NULL
        WHERE status <> 'OFFLINE'
          AND last_heartbeat < $1
        RETURNING id
        "#,
    )
    .bind(cutoff)
    .fetch_all(&mut *tx)
    .await
    .context("Failed to mark stale workers offline")?;

    // The updated_at guard leaves a just-claimed task alone while its owner
    // publishes WORKING.
    let orphaned: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE bountyboard b
        SET status = 'FAILURE',
            result = to_jsonb('Worker ' || COALESCE(b.worker_id, '<unknown>') || ' stopped heartbeating while running this task'),
            retry_count = b.retry_count + 1,
            updated_at = NOW()
        WHERE b.status = 'RUNNING'
          AND (b.updated_at IS NULL OR b.updated_at < $1)
          AND NOT EXISTS (
              SELECT 1 FROM peon p
              WHERE p.id = b.worker_id
                AND p.status <> 'OFFLINE'
                AND p.last_heartbeat >= $1
          )
        RETURNING b.id
        "#,
    )
    .bind(cutoff)
    .fetch_all(&mut *tx)
    .await
    .context("Failed to fail tasks of stale workers")?;

    tx.commit().await.context("Failed to commit sweep")?;

    let report = SweepReport {
        peons_marked_offline: stale.len() as u64,
        tasks_failed: orphaned.len() as u64,
    };
    if !report.is_empty() {
        warn!(
            workers = ?stale,
            tasks = ?orphaned,
            "Reclaimed tasks from stale workers"
        );
    }

    Ok(report)
}

pub async fn get_peon(pool: &PgPool, worker_id: &str) -> Result<Option<PeonRecord>> {
    sqlx::query_as(
        r#"
        SELECT id, status, current_task, queues, last_heartbeat
        FROM peon
        WHERE id = $1
        "#,
    )
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("Failed to get worker")
}

/// List workers, most recently seen first. OFFLINE rows only when asked.
pub async fn list_peons(pool: &PgPool, include_offline: bool) -> Result<Vec<PeonRecord>> {
    sqlx::query_as(
        r#"
        SELECT id, status, current_task, queues, last_heartbeat
        FROM peon
        WHERE $1 OR status <> 'OFFLINE'
        ORDER BY last_heartbeat DESC
        "#,
    )
    .bind(include_offline)
    .fetch_all(pool)
    .await
    .context("Failed to list workers")
}
