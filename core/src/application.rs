//! A loaded configuration paired with the connection pool built from it.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::worker::{Peon, Registry};

/// What [`crate::init::initialize`] hands back.
#[derive(Debug, Clone)]
pub struct Application {
    pub config: Config,
    pub pool: PgPool,
}

impl Application {
    /// Pure instantiation, no I/O.
    pub fn new(config: Config, pool: PgPool) -> Self {
        Self { config, pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A worker over this pool using the configured worker settings.
    pub fn peon(&self, registry: Registry) -> Peon {
        Peon::new(
            self.pool.clone(),
            Arc::new(registry),
            self.config.worker.clone(),
        )
    }
}
