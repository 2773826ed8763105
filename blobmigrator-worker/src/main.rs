use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blobmigrator_worker::config::MigratorConfig;
use blobmigrator_worker::coordinator::ShardCoordinator;
use blobmigrator_worker::db::Db;
use blobmigrator_worker::jobs::JobQueue;
use blobmigrator_worker::mapping::MappingStore;
use blobmigrator_worker::migrator::Migrator;
use blobmigrator_worker::scrubber::Scrubber;
use blobmigrator_worker::{backend, source};

const DEFAULT_CONFIG_PATH: &str = "blobmigrator.toml";

#[derive(Parser)]
#[command(author, version, about = "Migrate blobs from a legacy content store into object storage", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH, env = "BLOBMIGRATOR_CONFIG")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy every source blob into BUCKET, then run the deferred copies
    Migrate {
        #[arg(long)]
        bucket: String,
    },
    /// Continue an interrupted migration job
    Resume { job_id: String },
    /// Run any queued deferred copies
    Drain,
    /// Print a job's status and counters as JSON
    Status { job_id: String },
    /// Permanently delete mapping entries or source blobs
    Scrub {
        #[command(subcommand)]
        target: ScrubTarget,
    },
    /// Print a blob's mapping entry and destination object
    Inspect { blob_id: String },
}

#[derive(Subcommand)]
enum ScrubTarget {
    /// Delete every mapping entry. A later migration re-copies everything.
    Mappings {
        #[arg(long)]
        confirm: bool,
    },
    /// Delete the source blobs that have a mapping entry
    Blobs {
        #[arg(long)]
        confirm: bool,
    },
    /// Delete ALL source blobs, including ones that were never migrated
    AllBlobs {
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = MigratorConfig::load(&cli.config)?;
    if let Ok(dir) = std::env::var("BLOBMIGRATOR_STATE_DIR") {
        config.state_dir = PathBuf::from(dir);
    }
    let config = Arc::new(config);

    let db = Db::open(&config.db_path())?;
    let mappings = MappingStore::open(db.clone(), &config.mapping_store_name)?;
    let queue = JobQueue::open(db, config.max_attempts)?;
    info!(state = %config.db_path().display(), "State database open");

    match cli.command {
        Command::Migrate { bucket } => {
            let migrator = build_migrator(&config, &mappings, &queue)?;
            migrator.probe_writable(&bucket).await?;
            let coordinator = ShardCoordinator::new(migrator.clone(), queue.clone());
            let work = async {
                let report = coordinator.run(&bucket).await?;
                let deferred = queue.drain(&migrator).await?;
                anyhow::Ok(serde_json::json!({
                    "job_id": report.job_id,
                    "counters": report.counters,
                    "deferred_completed": deferred.completed,
                    "deferred_failed": deferred.failed,
                }))
            };
            print_json(&interruptible(work).await?)
        }
        Command::Resume { job_id } => {
            let migrator = build_migrator(&config, &mappings, &queue)?;
            let coordinator = ShardCoordinator::new(migrator.clone(), queue.clone());
            let work = async {
                let report = coordinator.resume(&job_id).await?;
                let deferred = queue.drain(&migrator).await?;
                anyhow::Ok(serde_json::json!({
                    "job_id": report.job_id,
                    "counters": report.counters,
                    "deferred_completed": deferred.completed,
                    "deferred_failed": deferred.failed,
                }))
            };
            print_json(&interruptible(work).await?)
        }
        Command::Drain => {
            let migrator = build_migrator(&config, &mappings, &queue)?;
            let report = interruptible(async { anyhow::Ok(queue.drain(&migrator).await?) }).await?;
            print_json(&serde_json::json!({
                "completed": report.completed,
                "failed": report.failed,
            }))
        }
        Command::Status { job_id } => {
            let status = queue
                .status(&job_id)?
                .ok_or_else(|| anyhow!("no job with id {}", job_id))?;
            print_json(&status)
        }
        Command::Scrub { target } => {
            let source = source::from_config(&config.source)?;
            let scrubber = Scrubber::new(source, mappings, queue, config.shard_count, config.page_size);
            let report = match target {
                ScrubTarget::Mappings { confirm } => scrubber.scrub_mappings(confirm).await,
                ScrubTarget::Blobs { confirm } => scrubber.scrub_mapped_source_blobs(confirm).await,
                ScrubTarget::AllBlobs { confirm } => scrubber.scrub_all_source_blobs(confirm).await,
            }?;
            print_json(&report)
        }
        Command::Inspect { blob_id } => {
            let Some(entry) = mappings.get(&blob_id)? else {
                println!("{} has not been migrated", blob_id);
                return Ok(());
            };
            let destination = backend::from_config(&config.destination)?;
            let stat = destination.stat(&entry.destination_path).await?;
            print_json(&serde_json::json!({
                "mapping": entry,
                "object": stat.map(|s| serde_json::json!({
                    "size": s.size,
                    "content_type": s.content_type,
                    "headers": s.headers,
                })),
            }))
        }
    }
}

fn build_migrator(config: &Arc<MigratorConfig>, mappings: &MappingStore, queue: &JobQueue) -> anyhow::Result<Migrator> {
    let source = source::from_config(&config.source)?;
    let destination = backend::from_config(&config.destination)?;
    Ok(Migrator::new(
        config.clone(),
        source,
        destination,
        mappings.clone(),
        Arc::new(queue.clone()),
    ))
}

/// Run `work` until it finishes or Ctrl-C arrives. Interrupted jobs keep
/// their checkpoints and can be resumed.
async fn interruptible<T>(work: impl std::future::Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    tokio::select! {
        result = work => result,
        _ = signal::ctrl_c() => {
            warn!("Interrupted; run `blobmigrator resume <job-id>` to continue");
            Err(anyhow!("interrupted"))
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
