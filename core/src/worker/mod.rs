//! Worker side: handler registry, liveness, execution pipeline and poll loop.

mod liveness;
mod pipeline;
mod registry;
mod runner;

pub use liveness::Liveness;
pub use pipeline::execute_task;
pub use registry::{
    CallArgs, Hook, PostrunContext, PrerunContext, Registry, RegistryError, TaskHandler,
};
pub use runner::{Peon, PollResult};
