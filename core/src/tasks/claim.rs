use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, error};

use crate::types::*;

/// What a single claim attempt produced.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The task is now RUNNING and bound to the claiming worker.
    Claimed(Box<Task>),
    /// The candidate row failed validation and was marked INVALID.
    Invalid {
        task_id: String,
        error: TaskValidationError,
    },
    /// Nothing eligible.
    Empty,
}

impl ClaimOutcome {
    pub fn into_task(self) -> Option<Task> {
        match self {
            ClaimOutcome::Claimed(task) => Some(*task),
            _ => None,
        }
    }
}

/// Claim the oldest eligible task for a worker.
///
/// Eligible means PENDING, or FAILURE with `retry_on_failure` set and
/// `retry_count <= retry_limit`, whose `task_name` is one the worker can run
/// and whose `queue` the worker subscribes to. Candidates already locked by
/// another transaction are skipped, so concurrent workers never pick the same
/// row. Everything happens in one transaction; an error rolls it back.
///
/// A worker with no registered task names or no queues claims nothing.
pub async fn claim_task(
    pool: &PgPool,
    worker_id: &str,
    queues: &[String],
    task_names: &[String],
) -> Result<ClaimOutcome> {
    if task_names.is_empty() || queues.is_empty() {
        return Ok(ClaimOutcome::Empty);
    }

    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin claim transaction")?;

    let candidate: Option<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM bountyboard
        WHERE (status = 'PENDING'
               OR (status = 'FAILURE'
                   AND retry_on_failure = TRUE
                   AND retry_count <= retry_limit))
          AND task_name = ANY($1)
          AND queue = ANY($2)
        ORDER BY created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(task_names)
    .bind(queues)
    .fetch_optional(&mut *tx)
    .await
    .context("Failed to select claim candidate")?;

    let Some(task_id) = candidate else {
        tx.commit().await.context("Failed to close claim transaction")?;
        return Ok(ClaimOutcome::Empty);
    };

    // Row lock is already held from the candidate select.
    let record: TaskRecord = sqlx::query_as(
        r#"
        SELECT * FROM bountyboard
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(&task_id)
    .fetch_one(&mut *tx)
    .await
    .context("Failed to load claimed task")?;

    match Task::try_from(record) {
        Ok(mut task) => {
            sqlx::query(
                r#"
                UPDATE bountyboard
                SET status = $1,
                    worker_id = $2,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(TaskStatus::Running)
            .bind(worker_id)
            .bind(&task.id)
            .execute(&mut *tx)
            .await
            .context("Failed to mark task as running")?;

            tx.commit().await.context("Failed to commit claim")?;

            task.status = TaskStatus::Running;
            task.worker_id = Some(worker_id.to_string());
            debug!(task_id = %task.id, worker_id, "Claimed task");

            Ok(ClaimOutcome::Claimed(Box::new(task)))
        }
        Err(validation_error) => {
            error!(
                task_id = %task_id,
                error = %validation_error,
                "Error validating task, marking it as INVALID"
            );

            sqlx::query(
                r#"
                UPDATE bountyboard
                SET status = $1,
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(TaskStatus::Invalid)
            .bind(&task_id)
            .execute(&mut *tx)
            .await
            .context("Failed to mark task as invalid")?;

            tx.commit()
                .await
                .context("Failed to commit invalid task")?;

            Ok(ClaimOutcome::Invalid {
                task_id,
                error: validation_error,
            })
        }
    }
}
