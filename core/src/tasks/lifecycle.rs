use anyhow::{bail, Context, Result};
use sqlx::PgPool;

use crate::types::TaskOutcome;

/// Persist the outcome of a run.
///
/// Writes status and result in one UPDATE; a FAILURE also bumps
/// `retry_count` in the same statement. Only a row that is still RUNNING for
/// `worker_id` is touched: if a sweep or another worker took the task over in
/// the meantime, this returns an error and the result is discarded.
pub async fn finalize_task(
    pool: &PgPool,
    task_id: &str,
    worker_id: &str,
    outcome: &TaskOutcome,
) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE bountyboard
        SET status = $1,
            result = $2,
            retry_count = CASE WHEN $3 THEN retry_count + 1 ELSE retry_count END,
            updated_at = NOW()
        WHERE id = $4
          AND status = 'RUNNING'
          AND worker_id = $5
        "#,
    )
    .bind(outcome.status())
    .bind(outcome.result_json())
    .bind(outcome.is_failure())
    .bind(task_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .with_context(|| {
        format!(
            "Failed to update task {} status to {}",
            task_id,
            outcome.status()
        )
    })?;

    if updated.rows_affected() == 0 {
        bail!(
            "Task {} is no longer running on worker {}; {} result discarded",
            task_id,
            worker_id,
            outcome.status()
        );
    }

    Ok(())
}
