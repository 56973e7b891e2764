//! The durable queue contract (spec §3 "Queue entries", §4.6 "Population
//! pipeline").
//!
//! Two independent FIFO queues: the original-query queue (`Q_orig`), fed
//! by clients, and the fragment queue (`Q_frag`), fed by the
//! pre-processor. Both are durable, at-least-once, and pop atomically —
//! "a popped record is removed from the queue atomically... no two
//! workers receive the same queue entry" (spec §3, §5).

use async_trait::async_trait;
use partitioncache_types::{Fingerprint, PartitionDatatype, Result};

/// A popped original-query queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalQueueEntry {
    /// The raw SQL query text as submitted by the client.
    pub query: String,
    /// The partition key this query should be decomposed for.
    pub partition_key: String,
    /// The partition key's datatype, if known at push time.
    pub partition_datatype: Option<PartitionDatatype>,
}

/// A popped fragment queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentQueueEntry {
    /// The fragment's canonical SQL text.
    pub query: String,
    /// The fragment's fingerprint.
    pub fingerprint: Fingerprint,
    /// The partition key this fragment populates.
    pub partition_key: String,
    /// The partition key's datatype.
    pub partition_datatype: PartitionDatatype,
    /// The target cache backend name, or `None` to fall back to the
    /// handler-level default configured for `partition_key` at pop time
    /// (spec decision: this resolves locally to the component that owns
    /// the cache table layout, not to a process-wide environment
    /// default).
    pub cache_backend: Option<String>,
}

/// A single `(fragment_sql, fingerprint)` pair to enqueue, as produced
/// by the fragment generator.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentPush {
    /// The fragment's canonical SQL text.
    pub query: String,
    /// The fragment's fingerprint.
    pub fingerprint: Fingerprint,
}

/// Length of both queues, for the CLI's queue-count surface (spec §6
/// "Queue management: count").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueLengths {
    /// Number of entries currently in the original-query queue.
    pub original: usize,
    /// Number of entries currently in the fragment queue.
    pub fragment: usize,
}

/// The durable queue contract every provider (PostgreSQL, an in-memory
/// test double, ...) implements.
#[async_trait]
pub trait QueueHandler: std::fmt::Debug + Send + Sync {
    /// Push an original query onto `Q_orig`.
    async fn push_original(
        &self,
        query: &str,
        partition_key: &str,
        partition_datatype: Option<PartitionDatatype>,
    ) -> Result<bool>;

    /// Atomically pop the oldest entry from `Q_orig`, if any.
    async fn pop_original(&self) -> Result<Option<OriginalQueueEntry>>;

    /// Push a batch of fragments onto `Q_frag`, all sharing
    /// `partition_key`/`partition_datatype`/`cache_backend`.
    async fn push_fragments(
        &self,
        fragments: &[FragmentPush],
        partition_key: &str,
        partition_datatype: PartitionDatatype,
        cache_backend: Option<&str>,
    ) -> Result<bool>;

    /// Atomically pop the oldest entry from `Q_frag`, if any.
    async fn pop_fragment(&self) -> Result<Option<FragmentQueueEntry>>;

    /// Current length of both queues.
    async fn queue_lengths(&self) -> Result<QueueLengths>;

    /// Remove every entry from `Q_orig`, returning the count removed.
    async fn clear_original(&self) -> Result<usize>;

    /// Remove every entry from `Q_frag`, returning the count removed.
    async fn clear_fragment(&self) -> Result<usize>;

    /// Remove every entry from both queues, returning `(original,
    /// fragment)` counts removed.
    async fn clear_all(&self) -> Result<(usize, usize)> {
        let original = self.clear_original().await?;
        let fragment = self.clear_fragment().await?;
        Ok((original, fragment))
    }
}
