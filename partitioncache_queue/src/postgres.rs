//! PostgreSQL realisation of the durable queue contract (spec §6 "Queue
//! layout (PostgreSQL backend)").
//!
//! Each queue is one table keyed by a `BIGSERIAL` id that also fixes
//! FIFO insertion order. Pop is a single `DELETE ... RETURNING`
//! statement over a `FOR UPDATE SKIP LOCKED` row pick, so two workers
//! racing to pop never receive the same row and neither blocks on the
//! other's in-flight pop (spec §5 "Queue pops are atomic: no two workers
//! receive the same queue entry").

use crate::handler::{FragmentPush, FragmentQueueEntry, OriginalQueueEntry, QueueHandler, QueueLengths};
use async_trait::async_trait;
use observability_deps::tracing::debug;
use partitioncache_types::{Error, Fingerprint, PartitionDatatype, Result};
use sqlx::{PgPool, Row};

/// PostgreSQL-backed original-query and fragment queues.
#[derive(Debug)]
pub struct PgQueueHandler {
    pool: PgPool,
    queue_prefix: String,
}

impl PgQueueHandler {
    /// Construct a handler over an existing pool, bootstrapping both
    /// queue tables if they don't already exist.
    pub async fn new(pool: PgPool, queue_prefix: impl Into<String>) -> Result<Self> {
        let handler = Self {
            pool,
            queue_prefix: queue_prefix.into(),
        };
        handler.ensure_scaffolding().await?;
        Ok(handler)
    }

    fn original_table(&self) -> String {
        format!("{}_original_query_queue", self.queue_prefix)
    }

    fn fragment_table(&self) -> String {
        format!("{}_query_fragment_queue", self.queue_prefix)
    }

    async fn ensure_scaffolding(&self) -> Result<()> {
        let original = self.original_table();
        let fragment = self.fragment_table();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {original} (
                id BIGSERIAL PRIMARY KEY,
                query TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                partition_datatype TEXT,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {fragment} (
                id BIGSERIAL PRIMARY KEY,
                query TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                partition_datatype TEXT NOT NULL,
                cache_backend TEXT,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }
}

fn transient(e: sqlx::Error) -> Error {
    Error::BackendTransient {
        message: e.to_string(),
    }
}

#[async_trait]
impl QueueHandler for PgQueueHandler {
    async fn push_original(
        &self,
        query: &str,
        partition_key: &str,
        partition_datatype: Option<PartitionDatatype>,
    ) -> Result<bool> {
        let table = self.original_table();
        sqlx::query(&format!(
            "INSERT INTO {table} (query, partition_key, partition_datatype) VALUES ($1, $2, $3)"
        ))
        .bind(query)
        .bind(partition_key)
        .bind(partition_datatype.map(|d| d.as_str()))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }

    async fn pop_original(&self) -> Result<Option<OriginalQueueEntry>> {
        let table = self.original_table();
        let row = sqlx::query(&format!(
            "WITH next AS (
                SELECT id FROM {table} ORDER BY id ASC FOR UPDATE SKIP LOCKED LIMIT 1
             )
             DELETE FROM {table} WHERE id = (SELECT id FROM next)
             RETURNING query, partition_key, partition_datatype"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let query: String = row.try_get("query").map_err(transient)?;
                let partition_key: String = row.try_get("partition_key").map_err(transient)?;
                let datatype: Option<String> = row.try_get("partition_datatype").map_err(transient)?;
                Ok(Some(OriginalQueueEntry {
                    query,
                    partition_key,
                    partition_datatype: datatype.and_then(|d| d.parse().ok()),
                }))
            }
        }
    }

    async fn push_fragments(
        &self,
        fragments: &[FragmentPush],
        partition_key: &str,
        partition_datatype: PartitionDatatype,
        cache_backend: Option<&str>,
    ) -> Result<bool> {
        if fragments.is_empty() {
            return Ok(true);
        }
        let table = self.fragment_table();
        let mut tx = self.pool.begin().await.map_err(transient)?;
        for fragment in fragments {
            sqlx::query(&format!(
                "INSERT INTO {table} (query, fingerprint, partition_key, partition_datatype, cache_backend)
                 VALUES ($1, $2, $3, $4, $5)"
            ))
            .bind(&fragment.query)
            .bind(fragment.fingerprint.to_hex())
            .bind(partition_key)
            .bind(partition_datatype.as_str())
            .bind(cache_backend)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        }
        tx.commit().await.map_err(transient)?;
        debug!(partition_key, count = fragments.len(), "pushed fragment batch");
        Ok(true)
    }

    async fn pop_fragment(&self) -> Result<Option<FragmentQueueEntry>> {
        let table = self.fragment_table();
        let row = sqlx::query(&format!(
            "WITH next AS (
                SELECT id FROM {table} ORDER BY id ASC FOR UPDATE SKIP LOCKED LIMIT 1
             )
             DELETE FROM {table} WHERE id = (SELECT id FROM next)
             RETURNING query, fingerprint, partition_key, partition_datatype, cache_backend"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let query: String = row.try_get("query").map_err(transient)?;
                let fingerprint_hex: String = row.try_get("fingerprint").map_err(transient)?;
                let partition_key: String = row.try_get("partition_key").map_err(transient)?;
                let datatype_text: String = row.try_get("partition_datatype").map_err(transient)?;
                let cache_backend: Option<String> = row.try_get("cache_backend").map_err(transient)?;
                let fingerprint: Fingerprint = fingerprint_hex.parse().map_err(|_| Error::BackendTransient {
                    message: format!("malformed fingerprint in fragment queue: '{fingerprint_hex}'"),
                })?;
                let partition_datatype: PartitionDatatype = datatype_text.parse().map_err(|_| Error::BackendTransient {
                    message: format!("malformed partition datatype in fragment queue: '{datatype_text}'"),
                })?;
                Ok(Some(FragmentQueueEntry {
                    query,
                    fingerprint,
                    partition_key,
                    partition_datatype,
                    cache_backend,
                }))
            }
        }
    }

    async fn queue_lengths(&self) -> Result<QueueLengths> {
        let original = self.original_table();
        let fragment = self.fragment_table();
        let original_count: i64 = sqlx::query(&format!("SELECT count(*) AS n FROM {original}"))
            .fetch_one(&self.pool)
            .await
            .map_err(transient)?
            .try_get("n")
            .map_err(transient)?;
        let fragment_count: i64 = sqlx::query(&format!("SELECT count(*) AS n FROM {fragment}"))
            .fetch_one(&self.pool)
            .await
            .map_err(transient)?
            .try_get("n")
            .map_err(transient)?;
        Ok(QueueLengths {
            original: original_count as usize,
            fragment: fragment_count as usize,
        })
    }

    async fn clear_original(&self) -> Result<usize> {
        let table = self.original_table();
        let result = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear_fragment(&self) -> Result<usize> {
        let table = self.fragment_table();
        let result = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_prefixed() {
        let handler = PgQueueHandler {
            pool: unreachable_pool(),
            queue_prefix: "pcq".to_string(),
        };
        assert_eq!(handler.original_table(), "pcq_original_query_queue");
        assert_eq!(handler.fragment_table(), "pcq_query_fragment_queue");
    }

    fn unreachable_pool() -> PgPool {
        // A lazily-connecting pool never touches the network until a
        // query runs, which these table-name tests never do.
        PgPool::connect_lazy("postgres://localhost/unused").expect("lazy pool construction never fails")
    }
}
