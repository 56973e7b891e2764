//! In-memory [`QueueHandler`] used by pipeline tests so worker-pool and
//! pre-processor logic can be exercised without a PostgreSQL instance.

use crate::handler::{FragmentPush, FragmentQueueEntry, OriginalQueueEntry, QueueHandler, QueueLengths};
use async_trait::async_trait;
use partitioncache_types::{PartitionDatatype, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

/// FIFO queue pair backed by two `VecDeque`s behind a mutex.
#[derive(Debug, Default)]
pub struct InMemoryQueueHandler {
    original: Mutex<VecDeque<OriginalQueueEntry>>,
    fragment: Mutex<VecDeque<FragmentQueueEntry>>,
}

impl InMemoryQueueHandler {
    /// Construct an empty pair of queues.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueHandler for InMemoryQueueHandler {
    async fn push_original(
        &self,
        query: &str,
        partition_key: &str,
        partition_datatype: Option<PartitionDatatype>,
    ) -> Result<bool> {
        self.original.lock().unwrap().push_back(OriginalQueueEntry {
            query: query.to_string(),
            partition_key: partition_key.to_string(),
            partition_datatype,
        });
        Ok(true)
    }

    async fn pop_original(&self) -> Result<Option<OriginalQueueEntry>> {
        Ok(self.original.lock().unwrap().pop_front())
    }

    async fn push_fragments(
        &self,
        fragments: &[FragmentPush],
        partition_key: &str,
        partition_datatype: PartitionDatatype,
        cache_backend: Option<&str>,
    ) -> Result<bool> {
        let mut queue = self.fragment.lock().unwrap();
        for fragment in fragments {
            queue.push_back(FragmentQueueEntry {
                query: fragment.query.clone(),
                fingerprint: fragment.fingerprint,
                partition_key: partition_key.to_string(),
                partition_datatype,
                cache_backend: cache_backend.map(str::to_string),
            });
        }
        Ok(true)
    }

    async fn pop_fragment(&self) -> Result<Option<FragmentQueueEntry>> {
        Ok(self.fragment.lock().unwrap().pop_front())
    }

    async fn queue_lengths(&self) -> Result<QueueLengths> {
        Ok(QueueLengths {
            original: self.original.lock().unwrap().len(),
            fragment: self.fragment.lock().unwrap().len(),
        })
    }

    async fn clear_original(&self) -> Result<usize> {
        let mut queue = self.original.lock().unwrap();
        let n = queue.len();
        queue.clear();
        Ok(n)
    }

    async fn clear_fragment(&self) -> Result<usize> {
        let mut queue = self.fragment.lock().unwrap();
        let n = queue.len();
        queue.clear();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partitioncache_types::Fingerprint;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let handler = InMemoryQueueHandler::new();
        handler.push_original("SELECT 1", "zip", None).await.unwrap();
        handler.push_original("SELECT 2", "zip", None).await.unwrap();

        let first = handler.pop_original().await.unwrap().unwrap();
        assert_eq!(first.query, "SELECT 1");
        let second = handler.pop_original().await.unwrap().unwrap();
        assert_eq!(second.query, "SELECT 2");
        assert!(handler.pop_original().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fragment_batch_push_preserves_common_fields() {
        let handler = InMemoryQueueHandler::new();
        let batch = vec![
            FragmentPush {
                query: "SELECT zip FROM t1 WHERE t1.region = 1".to_string(),
                fingerprint: Fingerprint::of("SELECT zip FROM t1 WHERE t1.region = 1"),
            },
            FragmentPush {
                query: "SELECT zip FROM t1 WHERE t1.region = 2".to_string(),
                fingerprint: Fingerprint::of("SELECT zip FROM t1 WHERE t1.region = 2"),
            },
        ];
        handler
            .push_fragments(&batch, "zip", PartitionDatatype::Integer, Some("pg_array"))
            .await
            .unwrap();

        let popped = handler.pop_fragment().await.unwrap().unwrap();
        assert_eq!(popped.partition_key, "zip");
        assert_eq!(popped.partition_datatype, PartitionDatatype::Integer);
        assert_eq!(popped.cache_backend.as_deref(), Some("pg_array"));

        let lengths = handler.queue_lengths().await.unwrap();
        assert_eq!(lengths.fragment, 1);
    }

    #[tokio::test]
    async fn clear_all_empties_both_queues() {
        let handler = InMemoryQueueHandler::new();
        handler.push_original("SELECT 1", "zip", None).await.unwrap();
        handler
            .push_fragments(
                &[FragmentPush {
                    query: "SELECT 1".to_string(),
                    fingerprint: Fingerprint::of("SELECT 1"),
                }],
                "zip",
                PartitionDatatype::Integer,
                None,
            )
            .await
            .unwrap();

        let (original, fragment) = handler.clear_all().await.unwrap();
        assert_eq!((original, fragment), (1, 1));
        assert_eq!(handler.queue_lengths().await.unwrap(), QueueLengths::default());
    }
}
