pub mod application;
pub mod cli;
pub mod config;
pub mod db;
pub mod init;
pub mod peons;
pub mod tasks;
pub mod types;
pub mod worker;

// Re-export main types
pub use types::*;

pub use application::Application;
pub use config::{Config, DatabaseConfig, WorkerConfig};
pub use init::{initialize, InitBuilder, InitOptions};
pub use worker::{Peon, Registry};
