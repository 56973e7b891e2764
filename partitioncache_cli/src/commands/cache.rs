//! Cache management subcommands (spec §6 "Cache management": count /
//! copy / export / import / delete; partition deletion; pruning; cleanup
//! of termination and oversize entries; eviction).

use crate::backend::{build_cache_handler, parse_partition_datatype};
use crate::config::{ConnectionConfig, PartitionArg};
use clap::Parser;
use observability_deps::tracing::info;
use partitioncache_maintenance::EvictStrategy;
use partitioncache_time::SystemProvider;
use std::sync::Arc;
use thiserror::Error;

/// Errors a cache subcommand can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Something in the cache/maintenance layer failed.
    #[error("cache error: {0}")]
    Cache(#[from] partitioncache_types::Error),

    /// A free-form flag (e.g. `--partition-datatype`) was not a
    /// recognised value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// `cache count --partition-key ...`
#[derive(Debug, Parser)]
pub struct CountArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    #[clap(flatten)]
    pub partition: PartitionArg,
}

pub async fn count(args: CountArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let keys = handler.get_all_keys(&args.partition.partition_key).await?;
    println!("{}", keys.len());
    Ok(())
}

/// `cache delete --partition-key ... --fingerprint ...`
#[derive(Debug, Parser)]
pub struct DeleteArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    #[clap(flatten)]
    pub partition: PartitionArg,
    /// Hex-encoded fingerprint of the entry to remove.
    #[clap(long)]
    pub fingerprint: String,
}

pub async fn delete(args: DeleteArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let fingerprint = args
        .fingerprint
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid fingerprint '{}'", args.fingerprint)))?;
    let removed = handler.delete(fingerprint, &args.partition.partition_key).await?;
    info!(removed, "cache delete");
    Ok(())
}

/// `cache delete-partition --partition-key ...`
#[derive(Debug, Parser)]
pub struct DeletePartitionArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    #[clap(flatten)]
    pub partition: PartitionArg,
}

pub async fn delete_partition(args: DeletePartitionArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let dropped = partitioncache_maintenance::delete_partition(handler.as_ref(), &args.partition.partition_key).await?;
    info!(dropped, "delete-partition");
    Ok(())
}

/// `cache export --partition-key ...`, printed as newline-separated
/// `fingerprint,fragment_sql` pairs.
#[derive(Debug, Parser)]
pub struct ExportArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    #[clap(flatten)]
    pub partition: PartitionArg,
}

pub async fn export(args: ExportArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let queries = handler.get_all_queries(&args.partition.partition_key).await?;
    for (fingerprint, sql) in queries {
        println!("{},{}", fingerprint, sql);
    }
    Ok(())
}

/// `cache import --partition-key ... --partition-datatype ...` reads
/// `fingerprint,fragment_sql` pairs on stdin and re-registers their query
/// metadata (without the identifier set, which must be repopulated by the
/// pipeline — import restores the fragment catalogue, not stale results).
#[derive(Debug, Parser)]
pub struct ImportArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    #[clap(flatten)]
    pub partition: PartitionArg,
}

pub async fn import(args: ImportArgs, lines: impl Iterator<Item = String>) -> Result<(), Error> {
    let datatype = args
        .partition
        .partition_datatype
        .as_deref()
        .map(parse_partition_datatype)
        .transpose()
        .map_err(Error::InvalidConfig)?
        .ok_or_else(|| Error::InvalidConfig("--partition-datatype is required for import".to_string()))?;

    let handler = build_cache_handler(&args.connection).await?;
    handler.register_partition_key(&args.partition.partition_key, datatype, None).await?;

    let mut imported = 0;
    for line in lines {
        let Some((fingerprint_hex, sql)) = line.split_once(',') else {
            continue;
        };
        let Ok(fingerprint) = fingerprint_hex.parse() else {
            continue;
        };
        handler.set_query(fingerprint, sql, &args.partition.partition_key).await?;
        imported += 1;
    }
    info!(imported, "cache import");
    Ok(())
}

/// `cache copy --partition-key ... --target-partition-key ...`: copies
/// every entry from one partition to another, re-registering the target
/// partition key's datatype first if it isn't already known.
#[derive(Debug, Parser)]
pub struct CopyArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    /// The partition to copy entries from.
    #[clap(long)]
    pub partition_key: String,
    /// The partition to copy entries into; registered with the same
    /// datatype as the source if not already known.
    #[clap(long)]
    pub target_partition_key: String,
}

pub async fn copy(args: CopyArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let partitions = handler.get_partition_keys().await?;
    let datatype = partitions
        .iter()
        .find(|(pk, _)| pk == &args.partition_key)
        .map(|(_, dt)| *dt)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown source partition '{}'", args.partition_key)))?;
    handler.register_partition_key(&args.target_partition_key, datatype, None).await?;

    let mut copied = 0;
    for fingerprint in handler.get_all_keys(&args.partition_key).await? {
        let Some(ids) = handler.get(fingerprint, &args.partition_key).await? else {
            continue;
        };
        let sql = handler.get_query(fingerprint, &args.partition_key).await?.unwrap_or_default();
        handler.set_cache(fingerprint, &ids, &args.target_partition_key).await?;
        handler.set_query(fingerprint, &sql, &args.target_partition_key).await?;
        copied += 1;
    }
    info!(copied, from = %args.partition_key, to = %args.target_partition_key, "cache copy");
    Ok(())
}

/// `cache prune --days-old N [--partition-key ...]`
#[derive(Debug, Parser)]
pub struct PruneArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    /// Restrict pruning to this partition; all partitions if omitted.
    #[clap(long)]
    pub partition_key: Option<String>,
    /// Age threshold in days.
    #[clap(long)]
    pub days_old: u32,
}

pub async fn prune(args: PruneArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let time_provider: Arc<dyn partitioncache_time::TimeProvider> = Arc::new(SystemProvider::new());
    let report = partitioncache_maintenance::prune(handler.as_ref(), args.partition_key.as_deref(), args.days_old, &time_provider).await?;
    info!(removed = report.removed, "prune");
    Ok(())
}

/// `cache cleanup-termination --partition-key ...`
#[derive(Debug, Parser)]
pub struct CleanupTerminationArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    #[clap(flatten)]
    pub partition: PartitionArg,
}

pub async fn cleanup_termination(args: CleanupTerminationArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let report = partitioncache_maintenance::remove_termination_entries(handler.as_ref(), &args.partition.partition_key).await?;
    info!(removed = report.removed, "cleanup-termination");
    Ok(())
}

/// `cache cleanup-oversize --partition-key ... --max-cardinality N`
#[derive(Debug, Parser)]
pub struct CleanupOversizeArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    #[clap(flatten)]
    pub partition: PartitionArg,
    /// Entries whose identifier-set cardinality exceeds this are removed.
    #[clap(long)]
    pub max_cardinality: usize,
}

pub async fn cleanup_oversize(args: CleanupOversizeArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let report =
        partitioncache_maintenance::remove_large_entries(handler.as_ref(), &args.partition.partition_key, args.max_cardinality).await?;
    info!(removed = report.removed, "cleanup-oversize");
    Ok(())
}

/// `cache evict --partition-key ... --strategy <oldest|largest> --threshold N`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
#[clap(rename_all = "kebab-case")]
pub enum EvictStrategyArg {
    /// Evict the entries with the oldest `last_seen` first.
    Oldest,
    /// Evict the entries with the largest cardinality first.
    Largest,
}

impl From<EvictStrategyArg> for EvictStrategy {
    fn from(value: EvictStrategyArg) -> Self {
        match value {
            EvictStrategyArg::Oldest => EvictStrategy::Oldest,
            EvictStrategyArg::Largest => EvictStrategy::Largest,
        }
    }
}

#[derive(Debug, Parser)]
pub struct EvictArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
    #[clap(flatten)]
    pub partition: PartitionArg,
    /// Which entries to remove first once over `threshold`.
    #[clap(long, arg_enum, default_value = "oldest")]
    pub strategy: EvictStrategyArg,
    /// Target entry count to evict down to.
    #[clap(long)]
    pub threshold: usize,
}

pub async fn evict(args: EvictArgs) -> Result<(), Error> {
    let handler = build_cache_handler(&args.connection).await?;
    let report = partitioncache_maintenance::evict(
        handler.as_ref(),
        &args.partition.partition_key,
        args.strategy.into(),
        args.threshold,
    )
    .await?;
    info!(removed = report.removed, "evict");
    Ok(())
}
