//! `eviction-manager`: in-database eviction control (spec §6 "Population:
//! ... `eviction-manager` (in-database eviction control)"). Runs
//! [`partitioncache_maintenance::evict`] against every partition the
//! selected backend knows about, once or on a repeating interval, the way
//! [`crate::commands::processor`] re-reads its control row every tick
//! rather than depending on a database-side scheduler hook.

use crate::backend::build_cache_handler;
use crate::commands::cache::EvictStrategyArg;
use crate::config::ConnectionConfig;
use clap::Parser;
use observability_deps::tracing::{info, warn};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors `eviction-manager` can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Something in the cache/maintenance layer failed.
    #[error("eviction error: {0}")]
    Eviction(#[from] partitioncache_types::Error),

    /// Failed to install the Ctrl-C shutdown handler.
    #[error("failed to install shutdown signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Flags controlling the eviction manager.
#[derive(Debug, Parser)]
pub struct EvictionManagerArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    /// Which entries to remove first once a partition is over threshold.
    #[clap(long, arg_enum, default_value = "oldest")]
    pub strategy: EvictStrategyArg,
    /// Target entry count to evict each partition down to.
    #[clap(long)]
    pub threshold: usize,
    /// Re-run eviction on this interval, in seconds, until interrupted.
    /// Runs exactly once and exits when omitted.
    #[clap(long)]
    pub interval_secs: Option<u64>,
}

pub async fn run(args: EvictionManagerArgs) -> Result<(), Error> {
    match args.interval_secs {
        None => {
            run_once(&args).await?;
            Ok(())
        }
        Some(secs) => watch(&args, Duration::from_secs(secs)).await,
    }
}

async fn run_once(args: &EvictionManagerArgs) -> Result<(), partitioncache_types::Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let partitions = handler.get_partition_keys().await?;
    let mut total_removed = 0;
    for (partition_key, _) in partitions {
        let report = partitioncache_maintenance::evict(handler.as_ref(), &partition_key, args.strategy.into(), args.threshold).await?;
        total_removed += report.removed;
    }
    info!(total_removed, "eviction-manager tick");
    Ok(())
}

async fn watch(args: &EvictionManagerArgs, interval: Duration) -> Result<(), Error> {
    let shutdown = CancellationToken::new();
    let watcher_shutdown = shutdown.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher_shutdown.cancel();
        }
    });

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("eviction-manager received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = run_once(args).await {
            warn!(error = %e, "eviction-manager tick failed, retrying next interval");
        }
    }

    ctrl_c.abort();
    Ok(())
}
