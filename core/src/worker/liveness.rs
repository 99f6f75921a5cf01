use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::peons;
use crate::types::{PeonStatus, WorkerState};

/// Owns this worker's [`WorkerState`] and mirrors each transition into the
/// `peon` table.
///
/// Publishing is best-effort: a failed write is logged and the in-memory
/// state still moves on, so a flaky store never stalls task processing.
/// Every transition is also broadcast to [`Liveness::subscribe`] receivers.
#[derive(Debug)]
pub struct Liveness {
    pool: PgPool,
    state: WorkerState,
    updates: watch::Sender<WorkerState>,
}

impl Liveness {
    pub fn new(pool: PgPool, state: WorkerState) -> Self {
        let (updates, _) = watch::channel(state.clone());
        Self {
            pool,
            state,
            updates,
        }
    }

    /// Latest state, for tasks that need to republish it.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.updates.subscribe()
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn worker_id(&self) -> &str {
        &self.state.id
    }

    pub fn queues(&self) -> &[String] {
        &self.state.queues
    }

    pub async fn idle(&mut self) -> bool {
        self.transition(PeonStatus::Idle, None).await
    }

    pub async fn begin_task(&mut self, task_id: &str) -> bool {
        self.transition(PeonStatus::Working, Some(task_id.to_string()))
            .await
    }

    pub async fn finish_task(&mut self) -> bool {
        self.idle().await
    }

    pub async fn offline(&mut self) -> bool {
        self.transition(PeonStatus::Offline, None).await
    }

    /// Write the current state. Returns whether the write landed.
    pub async fn publish(&self) -> bool {
        match peons::publish_state(&self.pool, &self.state).await {
            Ok(()) => {
                debug!(
                    worker_id = %self.state.id,
                    status = %self.state.status,
                    current_task = ?self.state.current_task,
                    "Published worker state"
                );
                true
            }
            Err(e) => {
                warn!(
                    worker_id = %self.state.id,
                    status = %self.state.status,
                    error = ?e,
                    "Failed to publish worker state"
                );
                false
            }
        }
    }

    async fn transition(&mut self, status: PeonStatus, current_task: Option<String>) -> bool {
        self.state.status = status;
        self.state.current_task = current_task;
        self.updates.send_replace(self.state.clone());
        self.publish().await
    }
}
