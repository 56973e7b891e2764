//! The fragment worker pool (spec §4.6): a pool of cooperative tasks that
//! dequeue from `Q_frag`, execute fragments against the target database,
//! and write results into the cache.

use crate::db::{DbExecutor, ExecutionOptions, FragmentOutcome};
use observability_deps::tracing::{debug, error, warn};
use partitioncache_cache::CacheHandler;
use partitioncache_queue::{FragmentQueueEntry, QueueHandler};
use partitioncache_types::QueryStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How long an idle worker sleeps after finding `Q_frag` empty before
/// polling again.
const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(500);

/// Configuration shared by every worker in the pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker tasks.
    pub worker_count: usize,
    /// Per-fragment execution limits (spec §4.6 "a configured statement
    /// timeout and optional row-count limit").
    pub execution: ExecutionOptions,
    /// When `true`, re-execute a fragment even if it's already cached.
    /// Mirrors spec §4.6 "Skip if the fingerprint is already present in
    /// cache (unless a force-refresh flag is set)".
    pub force_refresh: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            execution: ExecutionOptions::default(),
            force_refresh: false,
        }
    }
}

/// Spawns `config.worker_count` worker tasks against `queue`/`cache`/
/// `executor`, returning a [`JoinSet`] the caller awaits to drain on
/// shutdown.
///
/// "Ordering between workers is not guaranteed; within a single worker,
/// operations complete in program order" (spec §4.6 "Scheduling model").
pub fn spawn_worker_pool(
    queue: Arc<dyn QueueHandler>,
    cache: Arc<dyn CacheHandler>,
    executor: Arc<dyn DbExecutor>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> JoinSet<()> {
    let mut tasks = JoinSet::new();
    for id in 0..config.worker_count {
        let queue = Arc::clone(&queue);
        let cache = Arc::clone(&cache);
        let executor = Arc::clone(&executor);
        let config = config.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            worker_loop(id, queue.as_ref(), cache.as_ref(), executor.as_ref(), &config, shutdown).await;
        });
    }
    tasks
}

async fn worker_loop(
    id: usize,
    queue: &dyn QueueHandler,
    cache: &dyn CacheHandler,
    executor: &dyn DbExecutor,
    config: &WorkerConfig,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            debug!(worker = id, "worker received shutdown signal, exiting");
            return;
        }

        let popped = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(worker = id, "worker cancelled at queue poll boundary");
                return;
            }
            popped = queue.pop_fragment() => popped,
        };

        let entry = match popped {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tokio::time::sleep(DEFAULT_IDLE_POLL).await;
                continue;
            }
            Err(e) => {
                error!(worker = id, error = %e, "failed to pop fragment, retrying after idle poll");
                tokio::time::sleep(DEFAULT_IDLE_POLL).await;
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(worker = id, fingerprint = %entry.fingerprint, "cancelled mid-fragment, discarding without mutating cache");
                return;
            }
            () = process_fragment(id, cache, executor, config, &entry) => {}
        }
    }
}

async fn process_fragment(
    worker_id: usize,
    cache: &dyn CacheHandler,
    executor: &dyn DbExecutor,
    config: &WorkerConfig,
    entry: &FragmentQueueEntry,
) {
    if !config.force_refresh {
        match cache.exists(entry.fingerprint, &entry.partition_key, true).await {
            Ok(true) => {
                debug!(worker = worker_id, fingerprint = %entry.fingerprint, "fragment already cached, skipping");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(worker = worker_id, error = %e, "existence check failed, executing fragment anyway");
            }
        }
    }

    let outcome = executor
        .execute_fragment(&entry.query, entry.partition_datatype, &config.execution)
        .await;

    let (identifiers, status) = match outcome {
        Ok(FragmentOutcome::Success(ids)) => (Some(ids), QueryStatus::Ok),
        Ok(FragmentOutcome::RowLimitExceeded) => (None, QueryStatus::Failed),
        Ok(FragmentOutcome::StatementTimeout) => (None, QueryStatus::Timeout),
        Err(e) => {
            warn!(worker = worker_id, error = %e, fingerprint = %entry.fingerprint, "fragment execution failed, leaving cache untouched");
            return;
        }
    };

    if let Err(e) = cache
        .set_entry(entry.fingerprint, &entry.partition_key, identifiers.as_ref(), &entry.query, status, true)
        .await
    {
        error!(worker = worker_id, error = %e, fingerprint = %entry.fingerprint, "failed to write cache entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ExecutionOptions, FragmentOutcome};
    use async_trait::async_trait;
    use partitioncache_cache::{CacheEntryMeta, CacheHandler, LazyCacheHandler};
    use partitioncache_queue::{FragmentPush, InMemoryQueueHandler};
    use partitioncache_types::{Fingerprint, IdentifierSet, Identifier, PartitionDatatype, Result};
    use std::any::Any;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// A bare-bones in-memory [`CacheHandler`] recording just enough state
    /// (`exists`/`set_cache`/`set_null`/status) to assert worker outcomes.
    #[derive(Debug, Default)]
    struct FakeCache {
        present: Mutex<BTreeSet<Fingerprint>>,
        stored: Mutex<std::collections::BTreeMap<Fingerprint, Option<IdentifierSet>>>,
        statuses: Mutex<std::collections::BTreeMap<Fingerprint, QueryStatus>>,
    }

    #[async_trait]
    impl CacheHandler for FakeCache {
        async fn register_partition_key(&self, _: &str, _: PartitionDatatype, _: Option<u32>) -> Result<()> {
            Ok(())
        }
        fn supported_datatypes(&self) -> &'static [PartitionDatatype] {
            &[PartitionDatatype::Integer]
        }
        async fn set_cache(&self, key: Fingerprint, identifiers: &IdentifierSet, _: &str) -> Result<bool> {
            self.present.lock().unwrap().insert(key);
            self.stored.lock().unwrap().insert(key, Some(identifiers.clone()));
            Ok(true)
        }
        async fn get(&self, key: Fingerprint, _: &str) -> Result<Option<IdentifierSet>> {
            Ok(self.stored.lock().unwrap().get(&key).cloned().flatten())
        }
        async fn set_null(&self, key: Fingerprint, _: &str) -> Result<bool> {
            self.present.lock().unwrap().insert(key);
            self.stored.lock().unwrap().insert(key, None);
            Ok(true)
        }
        async fn is_null(&self, key: Fingerprint, _: &str) -> Result<bool> {
            Ok(matches!(self.stored.lock().unwrap().get(&key), Some(None)))
        }
        async fn exists(&self, key: Fingerprint, _: &str, _: bool) -> Result<bool> {
            Ok(self.present.lock().unwrap().contains(&key))
        }
        async fn filter_existing_keys(&self, keys: &[Fingerprint], _: &str, _: bool) -> Result<BTreeSet<Fingerprint>> {
            let present = self.present.lock().unwrap();
            Ok(keys.iter().copied().filter(|k| present.contains(k)).collect())
        }
        async fn get_intersected(&self, _: &[Fingerprint], _: &str) -> Result<(Option<IdentifierSet>, usize)> {
            Ok((None, 0))
        }
        async fn delete(&self, key: Fingerprint, _: &str) -> Result<bool> {
            Ok(self.present.lock().unwrap().remove(&key))
        }
        async fn delete_partition(&self, _: &str) -> Result<bool> {
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
        async fn set_query_status(&self, key: Fingerprint, _: &str, status: QueryStatus) -> Result<bool> {
            self.statuses.lock().unwrap().insert(key, status);
            Ok(true)
        }
        async fn get_query_status(&self, key: Fingerprint, _: &str) -> Result<Option<QueryStatus>> {
            Ok(self.statuses.lock().unwrap().get(&key).copied())
        }
        async fn get_all_keys(&self, _: &str) -> Result<Vec<Fingerprint>> {
            Ok(self.present.lock().unwrap().iter().copied().collect())
        }
        async fn get_partition_keys(&self) -> Result<Vec<(String, PartitionDatatype)>> {
            Ok(vec![])
        }
        async fn list_entries(&self, _: &str) -> Result<Vec<CacheEntryMeta>> {
            Ok(vec![])
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

    #[derive(Debug)]
    struct FakeExecutor {
        outcome: FragmentOutcome,
    }

    #[async_trait]
    impl DbExecutor for FakeExecutor {
        async fn execute_fragment(
            &self,
            _: &str,
            _: PartitionDatatype,
            _: &ExecutionOptions,
        ) -> Result<FragmentOutcome> {
            Ok(self.outcome.clone())
        }
    }

    fn ids(values: &[i64]) -> IdentifierSet {
        values.iter().map(|v| Identifier::Integer(*v)).collect()
    }

    async fn run_one(queue: &InMemoryQueueHandler, cache: &FakeCache, executor: &FakeExecutor, config: &WorkerConfig) {
        let entry = queue.pop_fragment().await.unwrap().unwrap();
        process_fragment(0, cache, executor, config, &entry).await;
    }

    #[tokio::test]
    async fn successful_execution_writes_ok_status_and_identifiers() {
        let queue = InMemoryQueueHandler::new();
        queue
            .push_fragments(
                &[FragmentPush {
                    query: "SELECT zip FROM t1 WHERE t1.region = 1".to_string(),
                    fingerprint: Fingerprint::of("SELECT zip FROM t1 WHERE t1.region = 1"),
                }],
                "zip",
                PartitionDatatype::Integer,
                None,
            )
            .await
            .unwrap();

        let cache = FakeCache::default();
        let executor = FakeExecutor {
            outcome: FragmentOutcome::Success(ids(&[1001, 1002])),
        };
        let config = WorkerConfig::default();

        run_one(&queue, &cache, &executor, &config).await;

        let fp = Fingerprint::of("SELECT zip FROM t1 WHERE t1.region = 1");
        assert_eq!(cache.get(fp, "zip").await.unwrap(), Some(ids(&[1001, 1002])));
        assert_eq!(cache.get_query_status(fp, "zip").await.unwrap(), Some(QueryStatus::Ok));
    }

    #[tokio::test]
    async fn row_limit_exceeded_sets_null_with_failed_status() {
        let queue = InMemoryQueueHandler::new();
        let fp = Fingerprint::of("SELECT zip FROM t1 WHERE t1.region = 2");
        queue
            .push_fragments(
                &[FragmentPush {
                    query: "SELECT zip FROM t1 WHERE t1.region = 2".to_string(),
                    fingerprint: fp,
                }],
                "zip",
                PartitionDatatype::Integer,
                None,
            )
            .await
            .unwrap();

        let cache = FakeCache::default();
        let executor = FakeExecutor {
            outcome: FragmentOutcome::RowLimitExceeded,
        };
        let config = WorkerConfig::default();

        run_one(&queue, &cache, &executor, &config).await;

        assert_eq!(cache.get(fp, "zip").await.unwrap(), None);
        assert!(cache.is_null(fp, "zip").await.unwrap());
        assert_eq!(cache.get_query_status(fp, "zip").await.unwrap(), Some(QueryStatus::Failed));
    }

    #[tokio::test]
    async fn already_cached_fragment_is_skipped_unless_forced() {
        let queue = InMemoryQueueHandler::new();
        let fp = Fingerprint::of("SELECT zip FROM t1 WHERE t1.region = 3");
        queue
            .push_fragments(
                &[FragmentPush {
                    query: "SELECT zip FROM t1 WHERE t1.region = 3".to_string(),
                    fingerprint: fp,
                }],
                "zip",
                PartitionDatatype::Integer,
                None,
            )
            .await
            .unwrap();

        let cache = FakeCache::default();
        cache.set_cache(fp, &ids(&[1]), "zip").await.unwrap();
        let executor = FakeExecutor {
            outcome: FragmentOutcome::Success(ids(&[1, 2, 3])),
        };
        let config = WorkerConfig::default();

        run_one(&queue, &cache, &executor, &config).await;

        // Execution never ran: the original, pre-seeded value survives.
        assert_eq!(cache.get(fp, "zip").await.unwrap(), Some(ids(&[1])));
    }
}
