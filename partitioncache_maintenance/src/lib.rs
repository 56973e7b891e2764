//! Maintenance operations (spec §4.8): pruning by age, eviction by policy,
//! removal of termination markers and oversize entries, and partition
//! deletion.
//!
//! Every operation here is expressed purely in terms of
//! [`partitioncache_cache::CacheHandler`] — "all maintenance operations run
//! at the cache-handler interface; no maintenance path bypasses a handler's
//! contract" (spec §4.8). None of these functions know or care which
//! concrete backend they're talking to.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, missing_docs)]

use observability_deps::tracing::{debug, info};
use partitioncache_cache::{CacheEntryMeta, CacheHandler};
use partitioncache_time::TimeProviderRef;
use partitioncache_types::{QueryStatus, Result};

/// Eviction policy for [`evict`] (spec §4.8 "Strategies").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictStrategy {
    /// Remove the entries with the oldest `last_seen` first.
    Oldest,
    /// Remove the entries with the largest identifier-set cardinality
    /// first.
    Largest,
}

/// Counts of entries removed by a maintenance call, returned so the CLI
/// surface (spec §6 "Cache management") can report what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    /// Number of cache/metadata entries removed.
    pub removed: usize,
}

/// Deletes metadata rows (and their cache entries) whose `last_seen` is
/// older than `days_old`, for every partition key the handler knows about
/// ("cross-partition when no partition is specified", spec §4.8).
///
/// Passing `Some(partition_key)` restricts the sweep to that partition.
pub async fn prune(
    handler: &dyn CacheHandler,
    partition_key: Option<&str>,
    days_old: u32,
    time_provider: &TimeProviderRef,
) -> Result<MaintenanceReport> {
    let threshold = chrono::Duration::days(i64::from(days_old));
    let now = time_provider.now();

    let partitions = partitions_to_scan(handler, partition_key).await?;
    let mut removed = 0;
    for pk in partitions {
        let entries = handler.list_entries(&pk).await?;
        for entry in entries {
            if now.checked_duration_since(entry.last_seen)
                > threshold.to_std().unwrap_or(std::time::Duration::MAX)
            {
                if handler.delete(entry.fingerprint, &pk).await? {
                    removed += 1;
                }
            }
        }
    }
    info!(removed, days_old, "pruned aged cache entries");
    Ok(MaintenanceReport { removed })
}

/// Removes entries from `partition_key` until its entry count is at or
/// below `threshold`, selecting victims by `strategy`. A no-op when the
/// partition is already at or below `threshold` (spec §4.8 "A no-op when
/// below threshold").
pub async fn evict(
    handler: &dyn CacheHandler,
    partition_key: &str,
    strategy: EvictStrategy,
    threshold: usize,
) -> Result<MaintenanceReport> {
    let mut entries = handler.list_entries(partition_key).await?;
    if entries.len() <= threshold {
        debug!(partition_key, count = entries.len(), threshold, "eviction is a no-op");
        return Ok(MaintenanceReport::default());
    }

    match strategy {
        EvictStrategy::Oldest => entries.sort_by_key(|e| e.last_seen),
        EvictStrategy::Largest => entries.sort_by_key(|e| std::cmp::Reverse(e.cardinality.unwrap_or(0))),
    }

    let excess = entries.len() - threshold;
    let mut removed = 0;
    for entry in entries.into_iter().take(excess) {
        if handler.delete(entry.fingerprint, partition_key).await? {
            removed += 1;
        }
    }
    info!(partition_key, removed, ?strategy, "evicted cache entries");
    Ok(MaintenanceReport { removed })
}

/// Deletes every entry whose last execution ended in [`QueryStatus::Timeout`]
/// or [`QueryStatus::Failed`] — the NULL-sentinel entries a fragment's
/// resource-limit termination left behind (spec §4.8
/// "remove_termination_entries"; for backends without schema these are the
/// dual `_LIMIT_`/`_TIMEOUT_` sentinel keys, hidden behind the same
/// [`CacheEntryMeta::status`] field here).
pub async fn remove_termination_entries(handler: &dyn CacheHandler, partition_key: &str) -> Result<MaintenanceReport> {
    let entries = handler.list_entries(partition_key).await?;
    let mut removed = 0;
    for entry in entries {
        if is_termination_entry(&entry) && handler.delete(entry.fingerprint, partition_key).await? {
            removed += 1;
        }
    }
    info!(partition_key, removed, "removed termination-marker entries");
    Ok(MaintenanceReport { removed })
}

fn is_termination_entry(entry: &CacheEntryMeta) -> bool {
    matches!(entry.status, QueryStatus::Timeout | QueryStatus::Failed)
}

/// Deletes every entry whose identifier-set cardinality exceeds
/// `max_cardinality`. NULL-sentinel entries (no cardinality) are left to
/// [`remove_termination_entries`].
pub async fn remove_large_entries(
    handler: &dyn CacheHandler,
    partition_key: &str,
    max_cardinality: usize,
) -> Result<MaintenanceReport> {
    let entries = handler.list_entries(partition_key).await?;
    let mut removed = 0;
    for entry in entries {
        if entry.cardinality.is_some_and(|c| c > max_cardinality)
            && handler.delete(entry.fingerprint, partition_key).await?
        {
            removed += 1;
        }
    }
    info!(partition_key, removed, max_cardinality, "removed oversize entries");
    Ok(MaintenanceReport { removed })
}

/// Drops `partition_key`'s cache table/namespace, metadata rows, and
/// registry entry atomically (spec §4.8 "delete_partition").
pub async fn delete_partition(handler: &dyn CacheHandler, partition_key: &str) -> Result<bool> {
    let dropped = handler.delete_partition(partition_key).await?;
    if dropped {
        info!(partition_key, "deleted partition");
    }
    Ok(dropped)
}

async fn partitions_to_scan(handler: &dyn CacheHandler, partition_key: Option<&str>) -> Result<Vec<String>> {
    match partition_key {
        Some(pk) => Ok(vec![pk.to_string()]),
        None => Ok(handler
            .get_partition_keys()
            .await?
            .into_iter()
            .map(|(pk, _)| pk)
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use partitioncache_cache::{CacheHandler, LazyCacheHandler};
    use partitioncache_time::{MockProvider, Time, TimeProvider};
    use partitioncache_types::{Fingerprint, IdentifierSet, PartitionDatatype};
    use std::any::Any;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// A minimal in-memory [`CacheHandler`] just thorough enough to drive
    /// the maintenance operations under test.
    #[derive(Debug, Default)]
    struct FakeHandler {
        entries: Mutex<Vec<CacheEntryMeta>>,
    }

    impl FakeHandler {
        fn with_entries(entries: Vec<CacheEntryMeta>) -> Self {
            Self {
                entries: Mutex::new(entries),
            }
        }
    }

    #[async_trait]
    impl CacheHandler for FakeHandler {
        async fn register_partition_key(&self, _: &str, _: PartitionDatatype, _: Option<u32>) -> Result<()> {
            Ok(())
        }
        fn supported_datatypes(&self) -> &'static [PartitionDatatype] {
            &[PartitionDatatype::Integer]
        }
        async fn set_cache(&self, _: Fingerprint, _: &IdentifierSet, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn get(&self, _: Fingerprint, _: &str) -> Result<Option<IdentifierSet>> {
            Ok(None)
        }
        async fn set_null(&self, _: Fingerprint, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn is_null(&self, _: Fingerprint, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn exists(&self, _: Fingerprint, _: &str, _: bool) -> Result<bool> {
            Ok(true)
        }
        async fn filter_existing_keys(&self, _: &[Fingerprint], _: &str, _: bool) -> Result<BTreeSet<Fingerprint>> {
            Ok(BTreeSet::new())
        }
        async fn get_intersected(&self, _: &[Fingerprint], _: &str) -> Result<(Option<IdentifierSet>, usize)> {
            Ok((None, 0))
        }
        async fn delete(&self, key: Fingerprint, _: &str) -> Result<bool> {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|e| e.fingerprint != key);
            Ok(entries.len() < before)
        }
        async fn delete_partition(&self, _: &str) -> Result<bool> {
            self.entries.lock().unwrap().clear();
            Ok(true)
        }
        async fn set_query(&self, _: Fingerprint, _: &str, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn get_query(&self, _: Fingerprint, _: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn get_all_queries(&self, _: &str) -> Result<Vec<(Fingerprint, String)>> {
            Ok(vec![])
        }
        async fn set_query_status(&self, _: Fingerprint, _: &str, _: QueryStatus) -> Result<bool> {
            Ok(true)
        }
        async fn get_query_status(&self, _: Fingerprint, _: &str) -> Result<Option<QueryStatus>> {
            Ok(None)
        }
        async fn get_all_keys(&self, _: &str) -> Result<Vec<Fingerprint>> {
            Ok(self.entries.lock().unwrap().iter().map(|e| e.fingerprint).collect())
        }
        async fn get_partition_keys(&self) -> Result<Vec<(String, PartitionDatatype)>> {
            Ok(vec![("zip".to_string(), PartitionDatatype::Integer)])
        }
        async fn list_entries(&self, _: &str) -> Result<Vec<CacheEntryMeta>> {
            Ok(self.entries.lock().unwrap().clone())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_lazy(&self) -> Option<&dyn LazyCacheHandler> {
            None
        }
    }

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::of(text)
    }

    fn offset(t: Time, secs: i64) -> Time {
        Time::new(t.date_time() + chrono::Duration::seconds(secs))
    }

    #[tokio::test]
    async fn prune_removes_only_aged_entries() {
        let t0 = Time::from_timestamp_millis(0);
        let provider = MockProvider::new(t0);
        provider.inc(std::time::Duration::from_secs(10 * 86_400));
        let time_provider: TimeProviderRef = std::sync::Arc::new(provider);

        let fresh = offset(t0, 9 * 86_400);
        let handler = FakeHandler::with_entries(vec![
            CacheEntryMeta {
                fingerprint: fp("old"),
                last_seen: t0,
                cardinality: Some(3),
                status: QueryStatus::Ok,
            },
            CacheEntryMeta {
                fingerprint: fp("fresh"),
                last_seen: fresh,
                cardinality: Some(3),
                status: QueryStatus::Ok,
            },
        ]);

        let report = prune(&handler, Some("zip"), 5, &time_provider).await.unwrap();
        assert_eq!(report.removed, 1);
        let remaining = handler.list_entries("zip").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fingerprint, fp("fresh"));
    }

    #[tokio::test]
    async fn evict_below_threshold_is_noop() {
        let handler = FakeHandler::with_entries(vec![CacheEntryMeta {
            fingerprint: fp("a"),
            last_seen: Time::from_timestamp_millis(0),
            cardinality: Some(1),
            status: QueryStatus::Ok,
        }]);
        let report = evict(&handler, "zip", EvictStrategy::Oldest, 5).await.unwrap();
        assert_eq!(report.removed, 0);
    }

    #[tokio::test]
    async fn evict_oldest_keeps_most_recent() {
        let t0 = Time::from_timestamp_millis(0);
        let t1 = offset(t0, 60);
        let t2 = offset(t0, 120);
        let handler = FakeHandler::with_entries(vec![
            CacheEntryMeta {
                fingerprint: fp("a"),
                last_seen: t0,
                cardinality: Some(1),
                status: QueryStatus::Ok,
            },
            CacheEntryMeta {
                fingerprint: fp("b"),
                last_seen: t1,
                cardinality: Some(1),
                status: QueryStatus::Ok,
            },
            CacheEntryMeta {
                fingerprint: fp("c"),
                last_seen: t2,
                cardinality: Some(1),
                status: QueryStatus::Ok,
            },
        ]);
        let report = evict(&handler, "zip", EvictStrategy::Oldest, 1).await.unwrap();
        assert_eq!(report.removed, 2);
        let remaining = handler.list_entries("zip").await.unwrap();
        assert_eq!(remaining, vec![CacheEntryMeta {
            fingerprint: fp("c"),
            last_seen: t2,
            cardinality: Some(1),
            status: QueryStatus::Ok,
        }]);
    }

    #[tokio::test]
    async fn evict_largest_removes_highest_cardinality_first() {
        let handler = FakeHandler::with_entries(vec![
            CacheEntryMeta {
                fingerprint: fp("small"),
                last_seen: Time::from_timestamp_millis(0),
                cardinality: Some(10),
                status: QueryStatus::Ok,
            },
            CacheEntryMeta {
                fingerprint: fp("big"),
                last_seen: Time::from_timestamp_millis(0),
                cardinality: Some(1_000),
                status: QueryStatus::Ok,
            },
        ]);
        let report = evict(&handler, "zip", EvictStrategy::Largest, 1).await.unwrap();
        assert_eq!(report.removed, 1);
        let remaining = handler.list_entries("zip").await.unwrap();
        assert_eq!(remaining[0].fingerprint, fp("small"));
    }

    #[tokio::test]
    async fn remove_termination_entries_keeps_ok_rows() {
        let handler = FakeHandler::with_entries(vec![
            CacheEntryMeta {
                fingerprint: fp("ok"),
                last_seen: Time::from_timestamp_millis(0),
                cardinality: Some(2),
                status: QueryStatus::Ok,
            },
            CacheEntryMeta {
                fingerprint: fp("timed-out"),
                last_seen: Time::from_timestamp_millis(0),
                cardinality: None,
                status: QueryStatus::Timeout,
            },
            CacheEntryMeta {
                fingerprint: fp("limited"),
                last_seen: Time::from_timestamp_millis(0),
                cardinality: None,
                status: QueryStatus::Failed,
            },
        ]);
        let report = remove_termination_entries(&handler, "zip").await.unwrap();
        assert_eq!(report.removed, 2);
        let remaining = handler.list_entries("zip").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fingerprint, fp("ok"));
    }

    #[tokio::test]
    async fn remove_large_entries_uses_cardinality_threshold() {
        let handler = FakeHandler::with_entries(vec![
            CacheEntryMeta {
                fingerprint: fp("small"),
                last_seen: Time::from_timestamp_millis(0),
                cardinality: Some(5),
                status: QueryStatus::Ok,
            },
            CacheEntryMeta {
                fingerprint: fp("huge"),
                last_seen: Time::from_timestamp_millis(0),
                cardinality: Some(50_000),
                status: QueryStatus::Ok,
            },
        ]);
        let report = remove_large_entries(&handler, "zip", 100).await.unwrap();
        assert_eq!(report.removed, 1);
        let remaining = handler.list_entries("zip").await.unwrap();
        assert_eq!(remaining[0].fingerprint, fp("small"));
    }

    #[tokio::test]
    async fn delete_partition_drops_everything() {
        let handler = FakeHandler::with_entries(vec![CacheEntryMeta {
            fingerprint: fp("a"),
            last_seen: Time::from_timestamp_millis(0),
            cardinality: Some(1),
            status: QueryStatus::Ok,
        }]);
        assert!(delete_partition(&handler, "zip").await.unwrap());
        assert!(handler.list_entries("zip").await.unwrap().is_empty());
    }
}
