use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::db::test_helpers::with_test_db;
use crate::peons::{self, get_peon};
use crate::tasks::{claim_task, create_task, get_task};
use crate::types::{CreateTaskParams, PeonStatus, TaskPayload, TaskStatus};
use crate::worker::{CallArgs, PostrunContext};

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval_ms: 10,
        reconnect_backoff_ms: 10,
        error_backoff_ms: 10,
        heartbeat_interval_secs: 1,
        ..Default::default()
    }
}

fn sum_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .task("sum", |_id, call: CallArgs| async move {
            Ok::<_, anyhow::Error>(json!(call.arg::<i64>(0)? + call.arg::<i64>(1)?))
        })
        .unwrap();
    registry
}

fn unreachable_pool() -> PgPool {
    // Nothing listens on port 1
    sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy("postgres://nobody@127.0.0.1:1/nothing")
        .unwrap()
}

async fn wait_for_status(pool: &PgPool, task_id: &str, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = get_task(pool, task_id).await.unwrap().unwrap();
        if task.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} stuck in {}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_poll_once_observes_cancellation_first() {
    let mut peon = Peon::new(unreachable_pool(), Arc::new(sum_registry()), fast_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert_eq!(peon.poll_once(&cancel).await.unwrap(), PollResult::Cancelled);
}

#[tokio::test]
async fn test_poll_once_backs_off_when_disconnected() {
    let mut peon = Peon::new(unreachable_pool(), Arc::new(sum_registry()), fast_config())
        .with_worker_id("peon-offline");
    assert_eq!(peon.worker_id(), "peon-offline");

    let cancel = CancellationToken::new();
    assert_eq!(peon.poll_once(&cancel).await.unwrap(), PollResult::Disconnected);
    assert_eq!(peon.state().status, PeonStatus::Idle);
}

#[tokio::test]
async fn test_run_fails_without_database() {
    let peon = Peon::new(unreachable_pool(), Arc::new(sum_registry()), fast_config());

    let err = peon.run(CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("Worker cannot start"));
}

#[tokio::test]
async fn test_claim_failure_counts_as_idle_cycle() {
    let peon = Peon::new(unreachable_pool(), Arc::new(sum_registry()), fast_config());

    assert!(matches!(peon.claim_next().await, ClaimOutcome::Empty));
}

#[tokio::test]
#[ignore] // Requires database to be running
async fn test_sum_example_end_to_end() {
    let db = with_test_db().await;

    let id = assert_ok!(
        create_task(&db, CreateTaskParams::new("sum").args(vec![json!(2), json!(3)])).await
    );

    let mut peon = Peon::new(db.pool().clone(), Arc::new(sum_registry()), fast_config())
        .with_worker_id("peon-sum");
    let cancel = CancellationToken::new();

    let result = peon.poll_once(&cancel).await.unwrap();
    assert_eq!(result, PollResult::Worked(TaskOutcome::Success(json!(5))));

    let task = get_task(&db, &id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.result, Some(json!(5)));
    assert_eq!(task.worker_id.as_deref(), Some("peon-sum"));

    let row = get_peon(&db, "peon-sum").await.unwrap().unwrap();
    assert_eq!(row.status, PeonStatus::Idle);
    assert_eq!(row.current_task, None);

    // Board is empty now
    assert_eq!(peon.poll_once(&cancel).await.unwrap(), PollResult::Idle);
}

#[tokio::test]
#[ignore] // Requires database to be running
async fn test_run_until_cancelled_goes_offline() {
    let db = with_test_db().await;

    let id = assert_ok!(
        create_task(&db, CreateTaskParams::new("sum").args(vec![json!(20), json!(22)])).await
    );

    let peon = Peon::new(db.pool().clone(), Arc::new(sum_registry()), fast_config())
        .with_worker_id("peon-run");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(peon.run(cancel.clone()));

    wait_for_status(&db, &id, TaskStatus::Success).await;

    cancel.cancel();
    assert_ok!(handle.await.unwrap());

    let row = get_peon(&db, "peon-run").await.unwrap().unwrap();
    assert_eq!(row.status, PeonStatus::Offline);
    let task = get_task(&db, &id).await.unwrap().unwrap();
    assert_eq!(task.result, Some(json!(42)));
}

#[tokio::test]
#[ignore] // Requires database to be running
async fn test_hooks_do_not_decide_the_outcome() {
    let db = with_test_db().await;

    let seen: Arc<Mutex<Vec<PostrunContext>>> = Arc::default();
    let sink = Arc::clone(&seen);

    let mut registry = Registry::new();
    registry
        .task("always_fails", |_id, _call| async move {
            Err::<JsonValue, _>(anyhow::anyhow!("bad input"))
        })
        .unwrap()
        .prerun(|_ctx| async move { Err::<(), _>(anyhow::anyhow!("prerun is broken too")) })
        .postrun(move |ctx| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(ctx);
                Ok::<_, anyhow::Error>(())
            }
        });

    let mut payload = TaskPayload::default();
    payload.postrun_handler_kwargs.insert("tag".to_string(), json!("nightly"));
    let id = assert_ok!(
        create_task(&db, CreateTaskParams::new("always_fails").payload(payload).retry(1)).await
    );

    let mut peon = Peon::new(db.pool().clone(), Arc::new(registry), fast_config());
    let cancel = CancellationToken::new();

    let result = peon.poll_once(&cancel).await.unwrap();
    let PollResult::Worked(TaskOutcome::Failure(diagnostic)) = result else {
        panic!("expected a failed run, got {result:?}");
    };
    assert!(diagnostic.contains("bad input"));

    let task = get_task(&db, &id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert_eq!(task.retry_count, 1);

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, TaskStatus::Failure);
        assert_eq!(seen[0].result, json!(diagnostic));
        assert_eq!(seen[0].args.kwargs.get("tag"), Some(&json!("nightly")));
    }

    // retry_limit = 1: one more run, then terminal
    assert!(matches!(
        peon.poll_once(&cancel).await.unwrap(),
        PollResult::Worked(TaskOutcome::Failure(_))
    ));
    assert_eq!(peon.poll_once(&cancel).await.unwrap(), PollResult::Idle);
    assert_eq!(get_task(&db, &id).await.unwrap().unwrap().retry_count, 2);
}

#[tokio::test]
#[ignore] // Requires database to be running
async fn test_lost_ownership_surfaces_as_error() {
    let db = with_test_db().await;

    let pool = db.pool().clone();
    let mut registry = Registry::new();
    registry
        .task("hijacked", move |task_id, _call| {
            let pool = pool.clone();
            async move {
                // Another worker takes over mid-run
                sqlx::query("UPDATE bountyboard SET worker_id = 'someone-else' WHERE id = $1")
                    .bind(&task_id)
                    .execute(&pool)
                    .await?;
                Ok::<_, anyhow::Error>(json!("done"))
            }
        })
        .unwrap();

    let id = assert_ok!(create_task(&db, CreateTaskParams::new("hijacked")).await);

    let mut peon = Peon::new(db.pool().clone(), Arc::new(registry), fast_config())
        .with_worker_id("peon-slow");
    let cancel = CancellationToken::new();

    assert!(peon.poll_once(&cancel).await.is_err());

    // The result was discarded but the worker is free again
    let task = get_task(&db, &id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.worker_id.as_deref(), Some("someone-else"));
    assert_eq!(peon.state().status, PeonStatus::Idle);
    let row = get_peon(&db, "peon-slow").await.unwrap().unwrap();
    assert_eq!(row.status, PeonStatus::Idle);
}

#[tokio::test]
#[ignore] // Requires database to be running
async fn test_cancel_mid_task_keeps_heartbeat_until_finished() {
    let db = with_test_db().await;

    let mut registry = Registry::new();
    registry
        .task("slow", |_id, _call| async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok::<_, anyhow::Error>(json!("slept"))
        })
        .unwrap();

    let id = assert_ok!(create_task(&db, CreateTaskParams::new("slow")).await);

    let config = WorkerConfig {
        stale_after_secs: 2,
        sweep_interval_secs: 0,
        ..fast_config()
    };
    let peon = Peon::new(db.pool().clone(), Arc::new(registry), config)
        .with_worker_id("peon-draining");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(peon.run(cancel.clone()));

    wait_for_status(&db, &id, TaskStatus::Running).await;
    cancel.cancel();

    // Past stale_after, handler still running
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let report = assert_ok!(peons::reclaim_stale_tasks(&db, Duration::from_secs(2)).await);
    assert!(report.is_empty(), "swept a draining worker: {report:?}");
    let queues = [crate::types::DEFAULT_QUEUE.to_string()];
    let other = assert_ok!(claim_task(&db, "peon-other", &queues, &["slow".to_string()]).await);
    assert!(matches!(other, ClaimOutcome::Empty));

    assert_ok!(handle.await.unwrap());

    let task = get_task(&db, &id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.result, Some(json!("slept")));
    assert_eq!(task.worker_id.as_deref(), Some("peon-draining"));
    assert_eq!(task.retry_count, 0);

    let row = get_peon(&db, "peon-draining").await.unwrap().unwrap();
    assert_eq!(row.status, PeonStatus::Offline);
    assert_eq!(row.current_task, None);
}

#[tokio::test]
#[ignore] // Requires database to be running
async fn test_heartbeat_restores_row_marked_offline() {
    let db = with_test_db().await;

    let peon = Peon::new(db.pool().clone(), Arc::new(sum_registry()), fast_config())
        .with_worker_id("peon-revived");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(peon.run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while get_peon(&db, "peon-revived").await.unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "worker never published");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // As a sweep from another worker would
    sqlx::query("UPDATE peon SET status = 'OFFLINE', current_task = NULL WHERE id = $1")
        .bind("peon-revived")
        .execute(db.pool())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let row = get_peon(&db, "peon-revived").await.unwrap().unwrap();
    assert_eq!(row.status, PeonStatus::Idle);
    assert_eq!(row.queues, vec![crate::types::DEFAULT_QUEUE.to_string()]);

    cancel.cancel();
    assert_ok!(handle.await.unwrap());
    let row = get_peon(&db, "peon-revived").await.unwrap().unwrap();
    assert_eq!(row.status, PeonStatus::Offline);
}
