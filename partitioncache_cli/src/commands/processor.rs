//! `postgresql-queue-processor setup|enable|disable|status|logs|test`
//! (spec §6 "in-database processor control"), wrapping
//! [`partitioncache_pipeline::InDatabaseProcessor`].

use crate::backend::{build_cache_handler, build_queue_handler, connect_postgres, PgExecutor};
use crate::config::ConnectionConfig;
use clap::Parser;
use observability_deps::tracing::info;
use partitioncache_pipeline::InDatabaseProcessor;
use partitioncache_time::SystemProvider;
use std::sync::Arc;
use thiserror::Error;

/// Errors a processor subcommand can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Something in the processor control plane failed.
    #[error("in-database processor error: {0}")]
    Processor(#[from] partitioncache_types::Error),
}

/// Flags shared by every `postgresql-queue-processor` subcommand.
#[derive(Debug, Parser)]
pub struct ProcessorArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    /// Table prefix for the processor's control/log tables; defaults to
    /// the shared cache table prefix.
    #[clap(long, env = "PARTITIONCACHE_PROCESSOR_TABLE_PREFIX")]
    pub control_prefix: Option<String>,
}

fn control_prefix(args: &ProcessorArgs) -> String {
    args.control_prefix.clone().unwrap_or_else(|| args.connection.effective_table_prefix().to_string())
}

async fn build_processor(args: &ProcessorArgs) -> Result<InDatabaseProcessor, Error> {
    let pool = connect_postgres(&args.connection).await?;
    let time_provider: Arc<dyn partitioncache_time::TimeProvider> = Arc::new(SystemProvider::new());
    Ok(InDatabaseProcessor::new(pool, control_prefix(args), time_provider))
}

pub async fn setup(args: ProcessorArgs) -> Result<(), Error> {
    let processor = build_processor(&args).await?;
    processor.setup().await?;
    info!("in-database processor control/log tables ready");
    Ok(())
}

pub async fn enable(args: ProcessorArgs) -> Result<(), Error> {
    let processor = build_processor(&args).await?;
    processor.enable().await?;
    info!("in-database processor enabled");
    Ok(())
}

pub async fn disable(args: ProcessorArgs) -> Result<(), Error> {
    let processor = build_processor(&args).await?;
    processor.disable().await?;
    info!("in-database processor disabled");
    Ok(())
}

pub async fn status(args: ProcessorArgs) -> Result<(), Error> {
    let processor = build_processor(&args).await?;
    let config = processor.status().await?;
    println!(
        "enabled={} period={:?} partitions={:?} max_parallel={}",
        config.enabled, config.period, config.partitions, config.max_parallel
    );
    Ok(())
}

/// `postgresql-queue-processor logs [--limit N]`
#[derive(Debug, Parser)]
pub struct LogsArgs {
    #[clap(flatten)]
    pub processor: ProcessorArgs,
    /// Maximum number of log rows to print, newest first.
    #[clap(long, default_value = "20")]
    pub limit: usize,
}

pub async fn logs(args: LogsArgs) -> Result<(), Error> {
    let processor = build_processor(&args.processor).await?;
    for entry in processor.logs(args.limit).await? {
        println!(
            "{} {} {} {}",
            entry.ran_at.date_time(),
            entry.fingerprint,
            entry.partition_key,
            entry.status.as_str()
        );
    }
    Ok(())
}

/// `postgresql-queue-processor test`: runs a single tick immediately,
/// independent of `enabled`/`period`.
pub async fn test(args: ProcessorArgs) -> Result<(), Error> {
    let processor = build_processor(&args).await?;
    let queue = build_queue_handler(&args.connection).await?;
    let cache = build_cache_handler(&args.connection).await?;
    let pool = connect_postgres(&args.connection).await?;
    let executor = PgExecutor::new(pool);
    let processed = processor.run_once(queue.as_ref(), cache.as_ref(), &executor).await?;
    println!("processed {processed} fragment(s)");
    Ok(())
}
