//! Startup for programs embedding a worker or a producer.
//!
//! ```rust,no_run
//! use workcraft_core::init::InitBuilder;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let app = InitBuilder::new()
//!     .database_url("postgres://workcraft@localhost/workcraft")
//!     .auto_migrate(true)
//!     .init()
//!     .await?;
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::application::Application;
use crate::config::Config;
use crate::db;

/// Options for initializing workcraft
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<PathBuf>,

    /// Run the embedded migration if the schema is missing
    pub auto_migrate: bool,

    /// Fail if the schema is missing and `auto_migrate` is off
    pub require_initialized: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            auto_migrate: false,
            require_initialized: true,
        }
    }
}

/// Builder for constructing InitOptions
#[derive(Debug, Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub fn require_initialized(mut self, require: bool) -> Self {
        self.options.require_initialized = require;
        self
    }

    pub fn options(&self) -> &InitOptions {
        &self.options
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

/// Load configuration, connect, and make sure the schema is usable.
///
/// Stateless: every call builds a fresh pool. Keep the returned
/// [`Application`] and pass it around.
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path)
        .build()
        .context("Failed to load configuration")?;

    let pool = db::create_pool(&config.database).await?;

    if let Err(e) = db::verify_database_setup(&pool).await {
        if options.auto_migrate {
            info!("Database schema missing, running migrations");
            db::migrate(&pool)
                .await
                .context("Failed to run automatic migrations")?;
        } else if options.require_initialized {
            return Err(e);
        } else {
            warn!(error = %e, "Continuing with an uninitialized database");
        }
    }

    Ok(Application::new(config, pool))
}
