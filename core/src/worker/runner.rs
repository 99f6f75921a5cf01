//! Poll loop: one claim, one execution, next claim.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::liveness::Liveness;
use super::pipeline::execute_task;
use super::registry::Registry;
use crate::config::WorkerConfig;
use crate::tasks::{self, ClaimOutcome};
use crate::types::{PeonStatus, TaskOutcome, WorkerState};
use crate::{db, peons};

/// What a single pass of the loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    /// Store unreachable; backed off.
    Disconnected,
    /// Nothing claimable (or the candidate was invalid).
    Idle,
    /// A task ran to completion with this outcome.
    Worked(TaskOutcome),
    /// Cancellation was observed before starting any work.
    Cancelled,
}

/// A worker process: claims tasks it has handlers for and runs them one at a
/// time until cancelled.
pub struct Peon {
    pool: PgPool,
    registry: Arc<Registry>,
    config: WorkerConfig,
    liveness: Liveness,
    connection_fine: bool,
    last_sweep: Option<Instant>,
}

impl Peon {
    pub fn new(pool: PgPool, registry: Arc<Registry>, config: WorkerConfig) -> Self {
        let state = WorkerState::new(config.queues.clone());
        let liveness = Liveness::new(pool.clone(), state);

        Self {
            pool,
            registry,
            config,
            liveness,
            connection_fine: false,
            last_sweep: None,
        }
    }

    /// Use a fixed worker id instead of a random one.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        let mut state = self.liveness.state().clone();
        state.id = worker_id.into();
        self.liveness = Liveness::new(self.pool.clone(), state);
        self
    }

    pub fn worker_id(&self) -> &str {
        self.liveness.worker_id()
    }

    pub fn state(&self) -> &WorkerState {
        self.liveness.state()
    }

    /// Run until `cancel` fires.
    ///
    /// Fails only if the schema is missing at startup. Once running, every
    /// fault is logged and followed by a backoff. A task already executing
    /// when cancellation arrives is finished and persisted before the worker
    /// goes OFFLINE.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        db::verify_database_setup(&self.pool)
            .await
            .context("Worker cannot start")?;

        self.liveness.idle().await;

        let task_names = self.registry.task_names();
        if task_names.is_empty() {
            warn!(worker_id = %self.worker_id(), "No task handlers registered; this worker will never claim anything");
        }
        info!(
            worker_id = %self.worker_id(),
            queues = ?self.liveness.queues(),
            tasks = ?task_names,
            "Peon started"
        );

        // Outlives `cancel`: an in-flight task keeps heartbeating until it is
        // finalized and the loop has exited.
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = self.config.heartbeat_interval().map(|interval| {
            tokio::spawn(heartbeat_loop(
                self.pool.clone(),
                self.liveness.subscribe(),
                interval,
                heartbeat_cancel.clone(),
            ))
        });

        loop {
            match self.poll_once(&cancel).await {
                Ok(PollResult::Cancelled) => break,
                Ok(_) => {}
                Err(e) => {
                    error!(worker_id = %self.worker_id(), error = ?e, "Error in worker loop");
                    if !sleep_or_cancel(&cancel, self.config.error_backoff()).await {
                        break;
                    }
                }
            }
        }

        heartbeat_cancel.cancel();
        if let Some(handle) = heartbeat {
            if let Err(e) = handle.await {
                warn!(worker_id = %self.worker_id(), error = %e, "Heartbeat task ended abnormally");
            }
        }

        self.liveness.offline().await;
        info!(worker_id = %self.worker_id(), "Peon stopped");

        Ok(())
    }

    /// One pass of the loop: connectivity check, poll sleep, optional sweep,
    /// one claim, and execution of whatever was claimed.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<PollResult> {
        if cancel.is_cancelled() {
            return Ok(PollResult::Cancelled);
        }

        if !db::check_connection(&self.pool).await {
            let backoff = self.config.reconnect_backoff();
            if self.connection_fine {
                warn!(worker_id = %self.worker_id(), "Lost connection to database");
            }
            warn!(
                worker_id = %self.worker_id(),
                retry_in = ?backoff,
                "Database unreachable, retrying"
            );
            self.connection_fine = false;

            return Ok(if sleep_or_cancel(cancel, backoff).await {
                PollResult::Disconnected
            } else {
                PollResult::Cancelled
            });
        }

        if !self.connection_fine {
            info!(worker_id = %self.worker_id(), "Connection to database established");
            self.connection_fine = true;
        }

        if !sleep_or_cancel(cancel, self.config.poll_interval()).await {
            return Ok(PollResult::Cancelled);
        }

        self.maybe_sweep().await;

        let task = match self.claim_next().await {
            ClaimOutcome::Claimed(task) => task,
            ClaimOutcome::Invalid { .. } | ClaimOutcome::Empty => return Ok(PollResult::Idle),
        };

        info!(
            worker_id = %self.worker_id(),
            task_id = %task.id,
            task_name = %task.task_name,
            "Executing task"
        );
        self.liveness.begin_task(&task.id).await;

        // Not raced against cancellation
        let outcome = execute_task(&self.pool, &self.registry, &mut self.liveness, &task).await?;

        Ok(PollResult::Worked(outcome))
    }

    /// A failed claim is logged and counts as an empty cycle.
    async fn claim_next(&self) -> ClaimOutcome {
        let claimed = tasks::claim_task(
            &self.pool,
            self.liveness.worker_id(),
            self.liveness.queues(),
            &self.registry.task_names(),
        )
        .await;

        match claimed {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(worker_id = %self.worker_id(), error = ?e, "Failed to claim task");
                ClaimOutcome::Empty
            }
        }
    }

    async fn maybe_sweep(&mut self) {
        let Some(interval) = self.config.sweep_interval() else {
            return;
        };
        if self.last_sweep.is_some_and(|last| last.elapsed() < interval) {
            return;
        }
        self.last_sweep = Some(Instant::now());

        match peons::reclaim_stale_tasks(&self.pool, self.config.stale_after()).await {
            Ok(report) if report.is_empty() => debug!("Stale worker sweep found nothing"),
            Ok(_) => {}
            Err(e) => warn!(worker_id = %self.worker_id(), error = ?e, "Stale worker sweep failed"),
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns false if cancelled.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Refresh `last_heartbeat` until cancelled. If the row is gone or was marked
/// OFFLINE by another worker's sweep, republish the full current state.
async fn heartbeat_loop(
    pool: PgPool,
    state: watch::Receiver<WorkerState>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let worker_id = state.borrow().id.clone();

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; the worker just published its state
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match peons::touch_heartbeat(&pool, &worker_id).await {
                    Ok(true) => debug!(worker_id = %worker_id, "Heartbeat"),
                    Ok(false) => {
                        let current = state.borrow().clone();
                        if current.status != PeonStatus::Offline {
                            warn!(worker_id = %worker_id, "Heartbeat found no live worker row, republishing state");
                            if let Err(e) = peons::publish_state(&pool, &current).await {
                                warn!(worker_id = %worker_id, error = ?e, "Failed to republish worker state");
                            }
                        }
                    }
                    Err(e) => warn!(worker_id = %worker_id, error = ?e, "Failed to send heartbeat"),
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/runner_tests.rs"]
mod tests;
