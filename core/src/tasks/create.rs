use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::types::*;

/// Enqueue a task as PENDING and return its id.
///
/// Uses the caller's id when given, otherwise a fresh UUID. An id that is
/// already on the board is rejected.
pub async fn create_task(pool: &PgPool, params: CreateTaskParams) -> Result<String> {
    if params.task_name.trim().is_empty() {
        bail!("Task name must not be empty");
    }
    if params.queue.trim().is_empty() {
        bail!("Queue name must not be empty");
    }
    if params.retry_limit < 0 {
        bail!("retry_limit must not be negative (got {})", params.retry_limit);
    }

    let id = params
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let payload =
        serde_json::to_value(&params.payload).context("Failed to serialize task payload")?;

    let inserted: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO bountyboard (
            id, task_name, queue, status, payload,
            retry_on_failure, retry_count, retry_limit
        ) VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
        ON CONFLICT (id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&id)
    .bind(&params.task_name)
    .bind(&params.queue)
    .bind(TaskStatus::Pending)
    .bind(&payload)
    .bind(params.retry_on_failure)
    .bind(params.retry_limit)
    .fetch_optional(pool)
    .await
    .context("Failed to create task")?;

    match inserted {
        Some(id) => {
            debug!(task_id = %id, task_name = %params.task_name, queue = %params.queue, "Enqueued task");
            Ok(id)
        }
        None => bail!("Task with id '{}' already exists", id),
    }
}
