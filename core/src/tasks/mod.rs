// Task management module
//
// This module handles all bountyboard operations:
// - Enqueueing tasks
// - Claiming tasks for workers (lock, validate, mark running)
// - Finalizing runs (status, result, retry accounting)
// - Querying tasks

mod claim;
mod create;
mod lifecycle;
mod query;


// Re-export public API
pub use claim::{claim_task, ClaimOutcome};
pub use create::create_task;
pub use lifecycle::finalize_task;
pub use query::{get_task, list_tasks};
