use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::debug;

use crate::config::DatabaseConfig;

#[cfg(test)]
pub mod test_helpers;

/// Tables the worker cannot run without.
pub const REQUIRED_TABLES: [&str; 2] = ["bountyboard", "peon"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Build connection options from either the URL or the individual fields.
pub fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
    if let Some(url) = config.url.as_deref().filter(|url| !url.trim().is_empty()) {
        return url
            .parse::<PgConnectOptions>()
            .context("Invalid database URL");
    }

    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.database);
    if !config.password.is_empty() {
        options = options.password(&config.password);
    }
    Ok(options)
}

/// Create the connection pool shared by every component of a worker.
///
/// The pool is created once at startup and handed out explicitly; each
/// operation checks a connection out and returns it when done.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let options = connect_options(config)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .connect_with(options)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    Ok(())
}

/// Cheap reachability probe. Never errors; any failure reads as unreachable.
pub async fn check_connection(pool: &PgPool) -> bool {
    let probe = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool);

    match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "Connectivity probe failed");
            false
        }
        Err(_) => {
            debug!(timeout_secs = PROBE_TIMEOUT.as_secs(), "Connectivity probe timed out");
            false
        }
    }
}

/// Fail unless every table in [`REQUIRED_TABLES`] exists.
pub async fn verify_database_setup(pool: &PgPool) -> Result<()> {
    let tables: Vec<String> = REQUIRED_TABLES.iter().map(|t| t.to_string()).collect();

    let missing: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT t FROM unnest($1::text[]) AS t
        WHERE to_regclass(t) IS NULL
        "#,
    )
    .bind(&tables)
    .fetch_all(pool)
    .await
    .context("Failed to inspect database schema")?;

    if !missing.is_empty() {
        bail!(
            "Database has not been initialized (missing tables: {})\n\n\
            Run `workcraft migrate` or provision the schema first.",
            missing.join(", ")
        );
    }

    Ok(())
}
