//! `monitor`: runs the external population pipeline (spec §6 "Population:
//! `monitor` (runs the external worker pipeline)") — the pre-processor
//! loop plus a pool of fragment workers, sharing one shutdown signal.

use crate::backend::{build_cache_handler, build_queue_handler, connect_postgres, PgExecutor};
use crate::config::ConnectionConfig;
use clap::Parser;
use observability_deps::tracing::info;
use partitioncache_pipeline::{run_preprocessor, spawn_worker_pool, ExecutionOptions, WorkerConfig};
use partitioncache_query::FragmentOptions;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors `monitor` can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Something in the cache/queue layer failed.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] partitioncache_types::Error),

    /// Failed to install the Ctrl-C shutdown handler.
    #[error("failed to install shutdown signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Flags controlling the pre-processor/worker pool.
#[derive(Debug, Parser)]
pub struct MonitorArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    /// Number of concurrent fragment workers.
    #[clap(long, env = "PARTITIONCACHE_WORKER_COUNT", default_value = "4")]
    pub worker_count: usize,
    /// Per-fragment statement timeout, in seconds.
    #[clap(long, env = "PARTITIONCACHE_STATEMENT_TIMEOUT_SECS", default_value = "30")]
    pub statement_timeout_secs: u64,
    /// Maximum rows a fragment may return before it's treated as oversize.
    #[clap(long)]
    pub row_limit: Option<usize>,
    /// Re-execute a fragment even if it is already cached.
    #[clap(long)]
    pub force_refresh: bool,
}

pub async fn run(args: MonitorArgs) -> Result<(), Error> {
    let queue = build_queue_handler(&args.connection).await?;
    let cache = build_cache_handler(&args.connection).await?;
    let pool = connect_postgres(&args.connection).await?;
    let executor: Arc<dyn partitioncache_pipeline::DbExecutor> = Arc::new(PgExecutor::new(pool));

    let shutdown = CancellationToken::new();
    let worker_config = WorkerConfig {
        worker_count: args.worker_count,
        execution: ExecutionOptions {
            statement_timeout: Duration::from_secs(args.statement_timeout_secs),
            row_limit: args.row_limit,
        },
        force_refresh: args.force_refresh,
    };

    let mut workers = spawn_worker_pool(
        Arc::clone(&queue),
        Arc::clone(&cache),
        Arc::clone(&executor),
        worker_config,
        shutdown.clone(),
    );

    let fragment_options = FragmentOptions::default();
    let preprocessor_shutdown = shutdown.clone();
    let preprocessor = tokio::spawn(async move {
        run_preprocessor(queue.as_ref(), &fragment_options, None, preprocessor_shutdown).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, draining pipeline");
    shutdown.cancel();

    let _ = preprocessor.await;
    while workers.join_next().await.is_some() {}

    Ok(())
}
