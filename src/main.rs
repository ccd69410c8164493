//! bulkimport CLI - Resilient, resumable batch imports.

use anyhow::{Context, Result};
use bulkimport::{
    CheckpointManager, ImportConfig, ImportOrchestrator, JsonlSession, MemorySession, Session,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "bulkimport")]
#[command(version)]
#[command(about = "Resilient, resumable batch imports with checkpoints and circuit breakers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a JSON-lines file
    Import {
        /// Path to the input file
        #[arg(short, long)]
        file: PathBuf,

        /// Table type, used to pick the record schema
        #[arg(short, long)]
        table: String,

        /// Operation ID; reuse it to resume a failed run
        #[arg(long)]
        operation_id: Option<String>,

        /// Append imported records to this JSONL file (dry run when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the latest checkpoint of an operation
    Status {
        #[arg(long)]
        operation_id: String,
    },

    /// Remove old checkpoints of an operation
    Cleanup {
        #[arg(long)]
        operation_id: String,

        /// Keep checkpoints younger than this many days
        #[arg(long, default_value = "7")]
        keep_days: u32,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

fn load_config(path: Option<&Path>) -> Result<ImportConfig> {
    match path {
        Some(path) => ImportConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {path:?}")),
        None => Ok(ImportConfig::default()),
    }
}

fn print_example_config() {
    let example = r#"# bulkimport configuration file

[storage]
checkpoint_dir = "state/checkpoints"
idempotency_dir = "state/idempotency"
log_dir = "state/logs"

[retry]
max_attempts = 3
base_delay_ms = 1000
max_delay_ms = 60000
exponential_base = 2.0
jitter = true
# retryable_kinds = ["processing", "io", "deadlock"]

[breakers.database]
failure_threshold = 5
recovery_timeout_ms = 60000
success_threshold = 2

[breakers.filesystem]
failure_threshold = 3
recovery_timeout_ms = 30000

[breakers.parsing]
failure_threshold = 10
recovery_timeout_ms = 30000

[transaction]
batch_size = 100
deadlock_max_retries = 3
deadlock_base_delay_ms = 100

[checkpoint]
interval_batches = 1
keep_days = 7

[validation]
allowed_extensions = ["jsonl"]

[schemas.employees]
required_fields = ["employee_id", "name"]
"#;
    println!("{example}");
}

async fn identity(record: Value) -> bulkimport::Result<Value> {
    Ok(record)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let path = cli
                .config
                .as_deref()
                .context("--config is required for validate")?;
            let config = load_config(Some(path))?;

            info!("Configuration is valid");
            info!(
                "  Retry: {} attempts, base delay {}ms",
                config.retry.max_attempts, config.retry.base_delay_ms
            );
            info!(
                "  Batches: {} records, checkpoint every {} batch(es)",
                config.transaction.batch_size, config.checkpoint.interval_batches
            );
            info!("  Schemas: {}", config.schemas.len());
        }

        Commands::Import {
            file,
            table,
            operation_id,
            output,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let operation_id =
                operation_id.unwrap_or_else(|| format!("import-{}", uuid::Uuid::new_v4()));

            let session: Box<dyn Session> = match &output {
                Some(path) => Box::new(
                    JsonlSession::new(path).context("Failed to open output session")?,
                ),
                None => {
                    warn!("No --output given, running as dry run");
                    Box::new(MemorySession::new())
                }
            };

            let orchestrator = ImportOrchestrator::new(&operation_id, config, session)
                .context("Failed to create import orchestrator")?;
            info!(operation_id = %operation_id, file = ?file, table = %table, "Starting import");

            let result = orchestrator.import_file(&file, &table, identity).await;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if !result.success {
                if result.can_resume {
                    warn!(operation_id = %operation_id, "Import failed; rerun with --operation-id to resume");
                }
                std::process::exit(1);
            }
        }

        Commands::Status { operation_id } => {
            let config = load_config(cli.config.as_deref())?;
            let manager = CheckpointManager::new(&config.storage.checkpoint_dir, &operation_id)
                .context("Failed to open checkpoint directory")?;

            match manager.load_checkpoint()? {
                Some(checkpoint) => {
                    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                }
                None => println!("No checkpoint for operation {operation_id}"),
            }
        }

        Commands::Cleanup {
            operation_id,
            keep_days,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let manager = CheckpointManager::new(&config.storage.checkpoint_dir, &operation_id)
                .context("Failed to open checkpoint directory")?;

            let removed = manager.cleanup_old_checkpoints(keep_days)?;
            println!("Removed {removed} checkpoint(s) older than {keep_days} day(s)");
        }
    }

    Ok(())
}
