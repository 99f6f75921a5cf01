//! A worker with one `sum` handler, plus a producer that enqueues `sum(2, 3)`.
//!
//! ```text
//! WORKCRAFT_DATABASE_URL=postgres://... cargo run --example sum_worker
//! ```
//!
//! Ctrl-C stops the worker; it finishes the task in hand and goes OFFLINE.

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use workcraft_core::cli::init_tracing;
use workcraft_core::init::InitBuilder;
use workcraft_core::tasks::create_task;
use workcraft_core::types::CreateTaskParams;
use workcraft_core::worker::{CallArgs, PostrunContext, PrerunContext, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let app = InitBuilder::new().auto_migrate(true).init().await?;

    let mut registry = Registry::new();
    registry
        .task("sum", |task_id, call: CallArgs| async move {
            let a: i64 = call.arg(0)?;
            let b: i64 = call.arg(1)?;
            info!(%task_id, a, b, "Adding");
            Ok::<_, anyhow::Error>(json!(a + b))
        })?
        .prerun(|ctx: PrerunContext| async move {
            info!(task_id = %ctx.task_id, task_name = %ctx.task_name, "About to run");
            Ok::<_, anyhow::Error>(())
        })
        .postrun(|ctx: PostrunContext| async move {
            info!(task_id = %ctx.task_id, status = %ctx.status, result = %ctx.result, "Finished");
            Ok::<_, anyhow::Error>(())
        });

    let task_id = create_task(
        app.pool(),
        CreateTaskParams::new("sum").args(vec![json!(2), json!(3)]),
    )
    .await?;
    info!(%task_id, "Enqueued sum(2, 3)");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    app.peon(registry).run(cancel).await
}
