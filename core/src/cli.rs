use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value as JsonValue};
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::types::{CreateTaskParams, TaskListFilter, TaskPayload, TaskStatus, DEFAULT_QUEUE};
use crate::{db, peons, tasks};

#[derive(Parser, Debug)]
#[command(name = "workcraft")]
#[command(about = "Workcraft - PostgreSQL-backed task queue", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the bountyboard and peon tables
    Migrate,

    /// Check that the database is reachable and initialized
    Verify,

    /// Put a task on the board
    Enqueue {
        /// Name of the registered handler to run
        task_name: String,

        #[arg(short = 'q', long = "queue", default_value = DEFAULT_QUEUE)]
        queue: String,

        /// Positional arguments (JSON array)
        #[arg(long)]
        args: Option<String>,

        /// Keyword arguments (JSON object)
        #[arg(long)]
        kwargs: Option<String>,

        /// Retry failed runs up to N more times
        #[arg(long)]
        retry_limit: Option<i32>,

        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },

    /// Show one task
    Status {
        task_id: String,
    },

    /// List tasks, newest first
    List {
        #[arg(short = 'q', long = "queue")]
        queue: Option<String>,

        /// PENDING, RUNNING, SUCCESS, FAILURE or INVALID
        #[arg(short = 's', long = "status")]
        status: Option<String>,

        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i64,
    },

    /// List workers
    Peons {
        /// Include workers that are OFFLINE
        #[arg(long)]
        all: bool,
    },

    /// Fail tasks held by workers that stopped heartbeating
    Sweep {
        /// Heartbeat age after which a worker counts as lost (default: from config)
        #[arg(long)]
        stale_after_secs: Option<u64>,
    },
}

/// Install the global subscriber. `RUST_LOG` wins; otherwise `info`.
/// Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    // Config errors show up before any command output
    let config = Config::builder()
        .database_url(cli.database_url)
        .config_path(cli.config)
        .build()?;

    let pool = db::create_pool(&config.database).await?;

    match cli.command {
        Commands::Migrate => {
            println!("Running migrations...");
            db::migrate(&pool).await?;
            println!("Migrations complete!");
        }

        Commands::Verify => {
            if !db::check_connection(&pool).await {
                bail!("Database is not reachable");
            }
            db::verify_database_setup(&pool).await?;
            println!("✓ Database is reachable and initialized");
        }

        Commands::Enqueue {
            task_name,
            queue,
            args,
            kwargs,
            retry_limit,
            id,
        } => {
            let payload = TaskPayload {
                task_args: parse_args(args.as_deref())?,
                task_kwargs: parse_kwargs(kwargs.as_deref())?,
                ..Default::default()
            };

            let mut params = CreateTaskParams::new(task_name).queue(queue).payload(payload);
            if let Some(limit) = retry_limit {
                params = params.retry(limit);
            }
            if let Some(id) = id {
                params = params.id(id);
            }

            let task_id = tasks::create_task(&pool, params).await?;
            println!("✓ Enqueued task {}", task_id);
        }

        Commands::Status { task_id } => print_task(&pool, &task_id).await?,

        Commands::List {
            queue,
            status,
            limit,
        } => {
            let status = status
                .map(|s| s.parse::<TaskStatus>())
                .transpose()?;

            let filter = TaskListFilter {
                queue,
                status,
                limit: Some(limit),
            };

            let found = tasks::list_tasks(&pool, filter).await?;
            if found.is_empty() {
                println!("No tasks found");
                return Ok(());
            }

            println!("Found {} task(s):\n", found.len());
            for task in found {
                println!(
                    "  {} | {} | {} | {} | retries {}/{}",
                    short_id(&task.id),
                    task.status,
                    task.queue,
                    task.task_name,
                    task.retry_count,
                    task.retry_limit
                );
            }
        }

        Commands::Peons { all } => {
            let found = peons::list_peons(&pool, all).await?;
            if found.is_empty() {
                println!("No workers found");
                return Ok(());
            }

            for peon in found {
                println!(
                    "  {} | {} | {} | queues {} | last seen {}",
                    short_id(&peon.id),
                    peon.status,
                    peon.current_task.as_deref().unwrap_or("-"),
                    peon.queues.join(","),
                    peon.last_heartbeat
                );
            }
        }

        Commands::Sweep { stale_after_secs } => {
            let stale_after = stale_after_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.worker.stale_after());

            let report = peons::reclaim_stale_tasks(&pool, stale_after).await?;
            println!(
                "✓ {} worker(s) marked offline, {} task(s) failed",
                report.peons_marked_offline, report.tasks_failed
            );
        }
    }

    Ok(())
}

async fn print_task(pool: &PgPool, task_id: &str) -> Result<()> {
    let Some(task) = tasks::get_task(pool, task_id).await? else {
        bail!("Task {} not found", task_id);
    };

    println!("Task: {}", task.id);
    println!("Name: {}", task.task_name);
    println!("Queue: {}", task.queue);
    println!("Status: {}", task.status);
    println!(
        "Retries: {}/{}{}",
        task.retry_count,
        task.retry_limit,
        if task.retry_on_failure { "" } else { " (retry disabled)" }
    );
    println!("Created: {}", task.created_at);
    if let Some(updated_at) = task.updated_at {
        println!("Updated: {}", updated_at);
    }
    if let Some(worker_id) = task.worker_id {
        println!("Worker: {}", worker_id);
    }
    println!("\nPayload:\n  {}", task.payload);
    if let Some(result) = task.result {
        println!("\nResult:\n  {}", result);
    }

    Ok(())
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

fn parse_args(raw: Option<&str>) -> Result<Vec<JsonValue>> {
    match raw {
        None => Ok(Vec::new()),
        Some(raw) => match serde_json::from_str(raw).context("--args is not valid JSON")? {
            JsonValue::Array(values) => Ok(values),
            other => bail!("--args must be a JSON array, got {}", other),
        },
    }
}

fn parse_kwargs(raw: Option<&str>) -> Result<Map<String, JsonValue>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(raw).context("--kwargs is not valid JSON")? {
            JsonValue::Object(map) => Ok(map),
            other => bail!("--kwargs must be a JSON object, got {}", other),
        },
    }
}
