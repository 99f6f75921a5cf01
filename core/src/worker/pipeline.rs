//! Execution pipeline for one claimed task: prerun, main, finalization,
//! postrun.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use super::liveness::Liveness;
use super::registry::{CallArgs, Hook, PostrunContext, PrerunContext, Registry};
use crate::tasks;
use crate::types::{Task, TaskOutcome};

/// Run a claimed task to completion.
///
/// Hook faults are logged and never affect the outcome. A failing, panicking
/// or missing main handler yields `TaskOutcome::Failure`. The only error that
/// escapes is a failure to persist the outcome; the worker is set back to
/// IDLE either way.
pub async fn execute_task(
    pool: &PgPool,
    registry: &Registry,
    liveness: &mut Liveness,
    task: &Task,
) -> Result<TaskOutcome> {
    run_prerun(registry, task).await;

    let outcome = run_main(registry, task).await;

    finalize(pool, liveness, task, &outcome).await?;

    run_postrun(registry, task, &outcome).await;

    Ok(outcome)
}

async fn run_prerun(registry: &Registry, task: &Task) {
    let Some(hook) = registry.prerun_hook() else {
        return;
    };

    let ctx = PrerunContext {
        task_id: task.id.clone(),
        task_name: task.task_name.clone(),
        args: CallArgs::new(
            task.payload.prerun_handler_args.clone(),
            task.payload.prerun_handler_kwargs.clone(),
        ),
    };

    if let Err(e) = call_hook(hook.as_ref(), ctx).await {
        error!(task_id = %task.id, stage = "prerun", error = ?e, "Prerun handler failed");
    }
}

async fn run_main(registry: &Registry, task: &Task) -> TaskOutcome {
    let Some(handler) = registry.get(&task.task_name) else {
        let diagnostic = format!("No handler registered for task '{}'", task.task_name);
        error!(task_id = %task.id, task_name = %task.task_name, "{}", diagnostic);
        return TaskOutcome::Failure(diagnostic);
    };

    let args = CallArgs::new(
        task.payload.task_args.clone(),
        task.payload.task_kwargs.clone(),
    );

    match AssertUnwindSafe(handler.call(&task.id, args))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => {
            info!(task_id = %task.id, task_name = %task.task_name, "Task completed");
            debug!(task_id = %task.id, result = %value, "Task result");
            TaskOutcome::Success(value)
        }
        Ok(Err(e)) => {
            error!(task_id = %task.id, task_name = %task.task_name, error = ?e, "Task failed");
            TaskOutcome::Failure(format!("{e:?}"))
        }
        Err(panic) => {
            let diagnostic = format!("Task handler panicked: {}", panic_message(panic.as_ref()));
            error!(task_id = %task.id, task_name = %task.task_name, "{}", diagnostic);
            TaskOutcome::Failure(diagnostic)
        }
    }
}

async fn finalize(
    pool: &PgPool,
    liveness: &mut Liveness,
    task: &Task,
    outcome: &TaskOutcome,
) -> Result<()> {
    let persisted = tasks::finalize_task(pool, &task.id, liveness.worker_id(), outcome).await;

    if let Err(e) = &persisted {
        error!(
            task_id = %task.id,
            status = %outcome.status(),
            error = ?e,
            "Failed to persist task outcome"
        );
    }

    liveness.finish_task().await;

    persisted
}

async fn run_postrun(registry: &Registry, task: &Task, outcome: &TaskOutcome) {
    let Some(hook) = registry.postrun_hook() else {
        return;
    };

    let ctx = PostrunContext {
        task_id: task.id.clone(),
        task_name: task.task_name.clone(),
        result: outcome.result_json(),
        status: outcome.status(),
        args: CallArgs::new(
            task.payload.postrun_handler_args.clone(),
            task.payload.postrun_handler_kwargs.clone(),
        ),
    };

    if let Err(e) = call_hook(hook.as_ref(), ctx).await {
        warn!(task_id = %task.id, stage = "postrun", error = ?e, "Postrun handler failed");
    }
}

async fn call_hook<C: Send + 'static>(hook: &dyn Hook<C>, ctx: C) -> Result<()> {
    match AssertUnwindSafe(hook.call(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("hook panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
