//! Outbox dispatcher - runs dispatch cycles against the outbox database.

mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use commands::Context;
use dispatch_config_and_utils::{init_logging, Config, Paths};
use tracing::debug;

/// Outbox dispatcher command-line interface.
#[derive(Parser)]
#[command(name = "outbox-dispatcher")]
#[command(about = "Delivers transactional outbox events through the operation ledger")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the config value
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, database and logs. Defaults to ~/.outbox-dispatch
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// SQLite database file. Overrides the configured path
    #[arg(long, global = true, env = "OUTBOX_DATABASE_PATH")]
    database: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text", global = true)]
    format: output::OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single dispatch cycle and print the per-event outcomes
    RunOnce {
        /// Events to claim. Defaults to the configured batch size
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Cycle clock as RFC 3339. Defaults to now
        #[arg(long)]
        now: Option<String>,
    },
    /// Poll: dispatch cycle then operation batch, until Ctrl-C
    Serve {
        /// Poll interval in milliseconds. Defaults to the config value
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Insert an outbox event
    Enqueue {
        /// Event type
        #[arg(short = 't', long)]
        event_type: String,
        /// Event payload as JSON
        #[arg(short, long)]
        payload: String,
        /// Event id. Defaults to a random UUID
        #[arg(long)]
        event_id: Option<String>,
        /// Correlation id carried into logs and the operation
        #[arg(long)]
        correlation_id: Option<String>,
        /// Id of the event or command that caused this one
        #[arg(long)]
        causation_id: Option<String>,
    },
    /// Run operation batches until nothing is runnable
    DrainOperations {
        /// Upper bound on batches
        #[arg(long, default_value = "100")]
        max_batches: usize,
    },
    /// Show event and operation counts
    Status {
        /// Dead-lettered events to list
        #[arg(long, default_value = "10")]
        dead_letters: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;

    let mut config = Config::load(&paths)?;
    if let Some(database) = cli.database {
        config.database_path = Some(database);
    }
    let level = cli.log_level.unwrap_or_else(|| config.log_level.clone());
    init_logging(&level, &paths, matches!(cli.command, Commands::Serve { .. }));
    debug!(database = %config.database_path(&paths).display(), "configuration loaded");

    let ctx = Context::new(paths, config, cli.format);

    match cli.command {
        Commands::RunOnce { batch_size, now } => {
            commands::run_once(&ctx, batch_size, now.as_deref()).await?;
        }
        Commands::Serve { interval_ms } => {
            commands::serve(&ctx, interval_ms).await?;
        }
        Commands::Enqueue {
            event_type,
            payload,
            event_id,
            correlation_id,
            causation_id,
        } => {
            let request = commands::EnqueueRequest {
                event_type,
                payload,
                event_id,
                correlation_id,
                causation_id,
            };
            commands::enqueue(&ctx, request).await?;
        }
        Commands::DrainOperations { max_batches } => {
            commands::drain_operations(&ctx, max_batches).await?;
        }
        Commands::Status { dead_letters } => {
            commands::status(&ctx, dead_letters).await?;
        }
    }

    Ok(())
}
