use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::types::*;

const DEFAULT_LIST_LIMIT: i64 = 100;

/// Get task by ID
pub async fn get_task(pool: &PgPool, task_id: &str) -> Result<Option<TaskRecord>> {
    sqlx::query_as(
        r#"
        SELECT * FROM bountyboard WHERE id = $1
        "#,
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("Failed to get task")
}

/// List tasks with filters, newest first
pub async fn list_tasks(pool: &PgPool, filter: TaskListFilter) -> Result<Vec<TaskRecord>> {
    let mut query: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM bountyboard WHERE 1=1");

    if let Some(queue) = filter.queue {
        query.push(" AND queue = ").push_bind(queue);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status);
    }

    query
        .push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1));

    query
        .build_query_as::<TaskRecord>()
        .fetch_all(pool)
        .await
        .context("Failed to list tasks")
}
