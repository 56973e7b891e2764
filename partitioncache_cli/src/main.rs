//! PartitionCache command-line surface (spec §6): cache/queue management,
//! population (`monitor`, `postgresql-queue-processor`,
//! `eviction-manager`).
//!
//! Thin by design: every subcommand glues `clap` to the library crates
//! (`SPEC_FULL.md` §A). Exit codes follow spec §6: `0` success, `1` any
//! unhandled error, `2` configuration validation failure.

mod backend;
mod commands;
mod config;

use clap::Parser;
use commands::{cache, eviction_manager, monitor, processor, queue};
use partitioncache_logging::LoggingConfig;
use std::process::ExitCode;
use thiserror::Error;

#[derive(Debug, Parser)]
#[clap(name = "partitioncache", about = "Cache, queue, and pipeline management for PartitionCache")]
struct Cli {
    #[clap(flatten)]
    logging: LoggingConfig,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Cache management: count / copy / export / import / delete;
    /// partition deletion; pruning; cleanup; eviction.
    #[clap(subcommand)]
    Cache(CacheCommand),
    /// Queue management: count / clear original / clear fragment / clear all.
    #[clap(subcommand)]
    Queue(QueueCommand),
    /// Runs the external worker pipeline (pre-processor + worker pool).
    Monitor(monitor::MonitorArgs),
    /// In-database processor control (co-located backends only).
    #[clap(subcommand, name = "postgresql-queue-processor")]
    PostgresqlQueueProcessor(ProcessorCommand),
    /// In-database eviction control.
    #[clap(name = "eviction-manager")]
    EvictionManager(eviction_manager::EvictionManagerArgs),
}

#[derive(Debug, clap::Subcommand)]
enum CacheCommand {
    Count(cache::CountArgs),
    Delete(cache::DeleteArgs),
    #[clap(name = "delete-partition")]
    DeletePartition(cache::DeletePartitionArgs),
    Export(cache::ExportArgs),
    Import(cache::ImportArgs),
    Copy(cache::CopyArgs),
    Prune(cache::PruneArgs),
    #[clap(name = "cleanup-termination")]
    CleanupTermination(cache::CleanupTerminationArgs),
    #[clap(name = "cleanup-oversize")]
    CleanupOversize(cache::CleanupOversizeArgs),
    Evict(cache::EvictArgs),
}

#[derive(Debug, clap::Subcommand)]
enum QueueCommand {
    Count(queue::CountArgs),
    #[clap(name = "clear-original")]
    ClearOriginal(queue::ClearOriginalArgs),
    #[clap(name = "clear-fragment")]
    ClearFragment(queue::ClearFragmentArgs),
    #[clap(name = "clear-all")]
    ClearAll(queue::ClearAllArgs),
}

#[derive(Debug, clap::Subcommand)]
enum ProcessorCommand {
    Setup(processor::ProcessorArgs),
    Enable(processor::ProcessorArgs),
    Disable(processor::ProcessorArgs),
    Status(processor::ProcessorArgs),
    Logs(processor::LogsArgs),
    Test(processor::ProcessorArgs),
}

/// Aggregated top-level error, distinguishing configuration-validation
/// failures (exit code 2) from any other unhandled error (exit code 1).
#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Cache(#[from] cache::Error),
    #[error(transparent)]
    Queue(#[from] queue::Error),
    #[error(transparent)]
    Monitor(#[from] monitor::Error),
    #[error(transparent)]
    Processor(#[from] processor::Error),
    #[error(transparent)]
    EvictionManager(#[from] eviction_manager::Error),
}

impl Error {
    /// Whether this error should map to exit code 2 (spec §6
    /// "configuration validation failure") rather than the generic 1.
    fn is_config_error(&self) -> bool {
        matches!(self, Error::Cache(cache::Error::InvalidConfig(_)))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    config::load_dotenv();
    let cli = Cli::parse();

    if let Err(e) = partitioncache_logging::install_global(&cli.logging) {
        eprintln!("error: logging setup failed: {e}");
        return ExitCode::from(2);
    }

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            if e.is_config_error() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

async fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Cache(cmd) => run_cache(cmd).await,
        Command::Queue(cmd) => run_queue(cmd).await,
        Command::Monitor(args) => monitor::run(args).await.map_err(Error::from),
        Command::PostgresqlQueueProcessor(cmd) => run_processor(cmd).await,
        Command::EvictionManager(args) => eviction_manager::run(args).await.map_err(Error::from),
    }
}

async fn run_cache(cmd: CacheCommand) -> Result<(), Error> {
    match cmd {
        CacheCommand::Count(args) => cache::count(args).await?,
        CacheCommand::Delete(args) => cache::delete(args).await?,
        CacheCommand::DeletePartition(args) => cache::delete_partition(args).await?,
        CacheCommand::Export(args) => cache::export(args).await?,
        CacheCommand::Import(args) => {
            let lines = std::io::stdin().lines().filter_map(Result::ok);
            cache::import(args, lines).await?
        }
        CacheCommand::Copy(args) => cache::copy(args).await?,
        CacheCommand::Prune(args) => cache::prune(args).await?,
        CacheCommand::CleanupTermination(args) => cache::cleanup_termination(args).await?,
        CacheCommand::CleanupOversize(args) => cache::cleanup_oversize(args).await?,
        CacheCommand::Evict(args) => cache::evict(args).await?,
    }
    Ok(())
}

async fn run_queue(cmd: QueueCommand) -> Result<(), Error> {
    match cmd {
        QueueCommand::Count(args) => queue::count(args).await?,
        QueueCommand::ClearOriginal(args) => queue::clear_original(args).await?,
        QueueCommand::ClearFragment(args) => queue::clear_fragment(args).await?,
        QueueCommand::ClearAll(args) => queue::clear_all(args).await?,
    }
    Ok(())
}

async fn run_processor(cmd: ProcessorCommand) -> Result<(), Error> {
    match cmd {
        ProcessorCommand::Setup(args) => processor::setup(args).await?,
        ProcessorCommand::Enable(args) => processor::enable(args).await?,
        ProcessorCommand::Disable(args) => processor::disable(args).await?,
        ProcessorCommand::Status(args) => processor::status(args).await?,
        ProcessorCommand::Logs(args) => processor::logs(args).await?,
        ProcessorCommand::Test(args) => processor::test(args).await?,
    }
    Ok(())
}
