//! Queue management subcommands (spec §6 "Queue management: count /
//! clear original / clear fragment / clear all").

use crate::backend::build_queue_handler;
use crate::config::ConnectionConfig;
use clap::Parser;
use observability_deps::tracing::info;
use thiserror::Error;

/// Errors a queue subcommand can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Something in the queue layer failed.
    #[error("queue error: {0}")]
    Queue(#[from] partitioncache_types::Error),
}

/// `queue count`
#[derive(Debug, Parser)]
pub struct CountArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
}

pub async fn count(args: CountArgs) -> Result<(), Error> {
    let queue = build_queue_handler(&args.connection).await?;
    let lengths = queue.queue_lengths().await?;
    println!("original={} fragment={}", lengths.original, lengths.fragment);
    Ok(())
}

/// `queue clear-original`
#[derive(Debug, Parser)]
pub struct ClearOriginalArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
}

pub async fn clear_original(args: ClearOriginalArgs) -> Result<(), Error> {
    let queue = build_queue_handler(&args.connection).await?;
    let removed = queue.clear_original().await?;
    info!(removed, "queue clear-original");
    Ok(())
}

/// `queue clear-fragment`
#[derive(Debug, Parser)]
pub struct ClearFragmentArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
}

pub async fn clear_fragment(args: ClearFragmentArgs) -> Result<(), Error> {
    let queue = build_queue_handler(&args.connection).await?;
    let removed = queue.clear_fragment().await?;
    info!(removed, "queue clear-fragment");
    Ok(())
}

/// `queue clear-all`
#[derive(Debug, Parser)]
pub struct ClearAllArgs {
    #[clap(flatten)]
    pub connection: ConnectionConfig,
}

pub async fn clear_all(args: ClearAllArgs) -> Result<(), Error> {
    let queue = build_queue_handler(&args.connection).await?;
    let (original, fragment) = queue.clear_all().await?;
    info!(original, fragment, "queue clear-all");
    Ok(())
}
