//! Run-length compressed bitmap cache over a co-located PostgreSQL
//! database, backed by the `roaringbitmap` extension
//! (`rb_build`/`rb_and_agg`/`rb_cardinality`/`rb_to_array`) and
//! [`croaring`] for in-application decoding of the byte-encoded
//! serialisation the extension returns, grounded in
//! `postgresql_roaringbit.py`'s `get`/`get_intersected`/
//! `get_intersected_lazy`.

use crate::handler::{reject_unsafe_lazy_sql, CacheEntryMeta, CacheHandler, LazyCacheHandler};
use async_trait::async_trait;
use croaring::Bitmap;
use observability_deps::tracing::debug;
use partitioncache_time::{Time, TimeProviderRef};
use partitioncache_types::error::UnsupportedDatatypeSnafu;
use partitioncache_types::{
    datatype::Identifier, Error, Fingerprint, IdentifierSet, PartitionDatatype, QueryStatus, Result,
};
use snafu::ensure;
use sqlx::{PgPool, Row};
use std::any::Any;
use std::collections::BTreeSet;

const SUPPORTED: &[PartitionDatatype] = &[PartitionDatatype::Integer];

/// Roaring-bitmap cache over a co-located PostgreSQL database.
#[derive(Debug)]
pub struct PgRoaringBitmapCache {
    pool: PgPool,
    table_prefix: String,
    time_provider: TimeProviderRef,
}

impl PgRoaringBitmapCache {
    /// Construct a handler over an existing pool. Assumes the
    /// `roaringbitmap` extension is already created on the target
    /// database — outside this crate's responsibility, same as any other
    /// PostgreSQL extension prerequisite.
    pub fn new(pool: PgPool, table_prefix: impl Into<String>, time_provider: TimeProviderRef) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.into(),
            time_provider,
        }
    }

    fn metadata_table(&self) -> String {
        format!("{}_partition_metadata", self.table_prefix)
    }

    fn queries_table(&self) -> String {
        format!("{}_queries", self.table_prefix)
    }

    fn cache_table(&self, partition_key: &str) -> String {
        format!("{}_cache_{}", self.table_prefix, partition_key)
    }

    async fn ensure_scaffolding(&self, partition_key: &str) -> Result<()> {
        let metadata = self.metadata_table();
        let queries = self.queries_table();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {metadata} (
                partition_key TEXT PRIMARY KEY,
                datatype TEXT NOT NULL CHECK (datatype = 'integer'),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {queries} (
                query_hash TEXT NOT NULL,
                query TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('ok','timeout','failed')),
                last_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (query_hash, partition_key)
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        let table = self.cache_table(partition_key);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                query_hash TEXT PRIMARY KEY,
                partition_keys roaringbitmap,
                partition_keys_count INTEGER GENERATED ALWAYS AS (
                    CASE WHEN partition_keys IS NULL THEN NULL ELSE rb_cardinality(partition_keys) END
                ) STORED
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    fn ids_to_i32s(identifiers: &IdentifierSet) -> Vec<i32> {
        identifiers.iter().filter_map(Identifier::as_i64).map(|v| v as i32).collect()
    }

    fn decode(bytes: &[u8]) -> IdentifierSet {
        Bitmap::deserialize(bytes)
            .iter()
            .map(|v| Identifier::Integer(v as i64))
            .collect()
    }
}

fn transient(e: sqlx::Error) -> Error {
    Error::BackendTransient {
        message: e.to_string(),
    }
}

#[async_trait]
impl CacheHandler for PgRoaringBitmapCache {
    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: PartitionDatatype,
        _bitsize: Option<u32>,
    ) -> Result<()> {
        ensure!(SUPPORTED.contains(&datatype), UnsupportedDatatypeSnafu { datatype });
        self.ensure_scaffolding(partition_key).await?;
        let metadata = self.metadata_table();
        sqlx::query(&format!(
            "INSERT INTO {metadata} (partition_key, datatype) VALUES ($1, 'integer')
             ON CONFLICT (partition_key) DO NOTHING"
        ))
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        debug!(partition_key, "registered roaring-bitmap partition key");
        Ok(())
    }

    fn supported_datatypes(&self) -> &'static [PartitionDatatype] {
        SUPPORTED
    }

    async fn set_cache(&self, key: Fingerprint, identifiers: &IdentifierSet, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        let values = Self::ids_to_i32s(identifiers);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys) VALUES ($1, rb_build($2))
             ON CONFLICT (query_hash) DO UPDATE SET partition_keys = excluded.partition_keys"
        ))
        .bind(key.to_hex())
        .bind(&values)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }

    async fn get(&self, key: Fingerprint, partition_key: &str) -> Result<Option<IdentifierSet>> {
        let table = self.cache_table(partition_key);
        let row = sqlx::query(&format!("SELECT partition_keys::bytea AS bits FROM {table} WHERE query_hash = $1"))
            .bind(key.to_hex())
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let bytes: Option<Vec<u8>> = row.try_get("bits").map_err(transient)?;
                Ok(bytes.map(|b| Self::decode(&b)))
            }
        }
    }

    async fn set_null(&self, key: Fingerprint, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys) VALUES ($1, NULL)
             ON CONFLICT (query_hash) DO UPDATE SET partition_keys = NULL"
        ))
        .bind(key.to_hex())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }

    async fn is_null(&self, key: Fingerprint, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        let row = sqlx::query(&format!(
            "SELECT partition_keys IS NULL AS is_null FROM {table} WHERE query_hash = $1"
        ))
        .bind(key.to_hex())
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.map(|r| r.try_get::<bool, _>("is_null").unwrap_or(false)).unwrap_or(false))
    }

    async fn exists(&self, key: Fingerprint, partition_key: &str, check_query: bool) -> Result<bool> {
        let table = self.cache_table(partition_key);
        let row = sqlx::query(&format!("SELECT 1 AS present FROM {table} WHERE query_hash = $1"))
            .bind(key.to_hex())
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        if row.is_none() {
            return Ok(false);
        }
        if !check_query {
            return Ok(true);
        }
        Ok(self.get_query_status(key, partition_key).await? == Some(QueryStatus::Ok))
    }

    async fn filter_existing_keys(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
        check_query: bool,
    ) -> Result<BTreeSet<Fingerprint>> {
        let mut out = BTreeSet::new();
        for key in keys {
            if self.exists(*key, partition_key, check_query).await? {
                out.insert(*key);
            }
        }
        Ok(out)
    }

    async fn get_intersected(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
    ) -> Result<(Option<IdentifierSet>, usize)> {
        let existing = self.filter_existing_keys(keys, partition_key, false).await?;
        if existing.is_empty() {
            return Ok((None, 0));
        }
        let table = self.cache_table(partition_key);
        let hashes = existing.iter().map(|k| format!("'{}'", k.to_hex())).collect::<Vec<_>>().join(", ");
        let row = sqlx::query(&format!(
            "SELECT rb_and_agg(partition_keys)::bytea AS bits FROM
                (SELECT partition_keys FROM {table} WHERE query_hash IN ({hashes})) AS selected"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        let set = row
            .and_then(|r| r.try_get::<Option<Vec<u8>>, _>("bits").ok().flatten())
            .map(|b| Self::decode(&b));
        Ok((set, existing.len()))
    }

    async fn delete(&self, key: Fingerprint, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        let queries = self.queries_table();
        let query_hash = key.to_hex();
        sqlx::query(&format!("DELETE FROM {table} WHERE query_hash = $1"))
            .bind(&query_hash)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        sqlx::query(&format!("DELETE FROM {queries} WHERE query_hash = $1 AND partition_key = $2"))
            .bind(&query_hash)
            .bind(partition_key)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(true)
    }

    async fn delete_partition(&self, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        let queries = self.queries_table();
        let metadata = self.metadata_table();
        let mut tx = self.pool.begin().await.map_err(transient)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}")).execute(&mut *tx).await.map_err(transient)?;
        sqlx::query(&format!("DELETE FROM {queries} WHERE partition_key = $1"))
            .bind(partition_key)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        sqlx::query(&format!("DELETE FROM {metadata} WHERE partition_key = $1"))
            .bind(partition_key)
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        tx.commit().await.map_err(transient)?;
        Ok(true)
    }

    async fn set_query(&self, key: Fingerprint, fragment_sql: &str, partition_key: &str) -> Result<bool> {
        let queries = self.queries_table();
        let now = self.time_provider.now();
        sqlx::query(&format!(
            "INSERT INTO {queries} (query_hash, query, partition_key, status, last_seen)
             VALUES ($1, $2, $3, 'ok', $4)
             ON CONFLICT (query_hash, partition_key) DO UPDATE SET query = $2, last_seen = $4"
        ))
        .bind(key.to_hex())
        .bind(fragment_sql)
        .bind(partition_key)
        .bind(now.date_time())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }

    async fn get_query(&self, key: Fingerprint, partition_key: &str) -> Result<Option<String>> {
        let queries = self.queries_table();
        let row = sqlx::query(&format!("SELECT query FROM {queries} WHERE query_hash = $1 AND partition_key = $2"))
            .bind(key.to_hex())
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        Ok(row.map(|r| r.try_get::<String, _>("query").unwrap_or_default()))
    }

    async fn get_all_queries(&self, partition_key: &str) -> Result<Vec<(Fingerprint, String)>> {
        let queries = self.queries_table();
        let rows = sqlx::query(&format!("SELECT query_hash, query FROM {queries} WHERE partition_key = $1"))
            .bind(partition_key)
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let hash: String = row.try_get("query_hash").map_err(transient)?;
            let text: String = row.try_get("query").map_err(transient)?;
            if let Ok(fp) = hash.parse::<Fingerprint>() {
                out.push((fp, text));
            }
        }
        Ok(out)
    }

    async fn set_query_status(&self, key: Fingerprint, partition_key: &str, status: QueryStatus) -> Result<bool> {
        let queries = self.queries_table();
        let now = self.time_provider.now();
        sqlx::query(&format!(
            "UPDATE {queries} SET status = $1, last_seen = $2 WHERE query_hash = $3 AND partition_key = $4"
        ))
        .bind(status.as_str())
        .bind(now.date_time())
        .bind(key.to_hex())
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }

    async fn get_query_status(&self, key: Fingerprint, partition_key: &str) -> Result<Option<QueryStatus>> {
        let queries = self.queries_table();
        let row = sqlx::query(&format!("SELECT status FROM {queries} WHERE query_hash = $1 AND partition_key = $2"))
            .bind(key.to_hex())
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let text: String = row.try_get("status").map_err(transient)?;
                Ok(text.parse().ok())
            }
        }
    }

    async fn get_all_keys(&self, partition_key: &str) -> Result<Vec<Fingerprint>> {
        let table = self.cache_table(partition_key);
        let rows = sqlx::query(&format!("SELECT query_hash FROM {table}"))
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.try_get::<String, _>("query_hash").ok())
            .filter_map(|h| h.parse().ok())
            .collect())
    }

    async fn get_partition_keys(&self) -> Result<Vec<(String, PartitionDatatype)>> {
        let metadata = self.metadata_table();
        let rows = sqlx::query(&format!("SELECT partition_key FROM {metadata}"))
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.try_get::<String, _>("partition_key").ok())
            .map(|pk| (pk, PartitionDatatype::Integer))
            .collect())
    }

    async fn list_entries(&self, partition_key: &str) -> Result<Vec<CacheEntryMeta>> {
        let table = self.cache_table(partition_key);
        let queries = self.queries_table();
        let rows = sqlx::query(&format!(
            "SELECT c.query_hash, c.partition_keys_count, q.status, q.last_seen
             FROM {table} c
             LEFT JOIN {queries} q ON q.query_hash = c.query_hash AND q.partition_key = $1"
        ))
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let hash: String = row.try_get("query_hash").map_err(transient)?;
            let Ok(fingerprint) = hash.parse::<Fingerprint>() else {
                continue;
            };
            let cardinality: Option<i32> = row.try_get("partition_keys_count").map_err(transient)?;
            let status: Option<String> = row.try_get("status").map_err(transient)?;
            let last_seen: Option<chrono::DateTime<chrono::Utc>> = row.try_get("last_seen").map_err(transient)?;
            out.push(CacheEntryMeta {
                fingerprint,
                last_seen: last_seen.map(Time::new).unwrap_or_else(|| self.time_provider.now()),
                cardinality: cardinality.map(|c| c as usize),
                status: status.and_then(|s| s.parse().ok()).unwrap_or(QueryStatus::Ok),
            });
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_lazy(&self) -> Option<&dyn LazyCacheHandler> {
        Some(self)
    }
}

#[async_trait]
impl LazyCacheHandler for PgRoaringBitmapCache {
    async fn get_intersected_lazy(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
    ) -> Result<(Option<String>, usize)> {
        let existing = self.filter_existing_keys(keys, partition_key, false).await?;
        if existing.is_empty() {
            return Ok((None, 0));
        }
        let table = self.cache_table(partition_key);
        let hashes = existing.iter().map(|k| format!("'{}'", k.to_hex())).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "WITH rb_result AS (
                SELECT rb_and_agg(partition_keys) AS bm FROM
                    (SELECT partition_keys FROM {table} WHERE query_hash IN ({hashes})) AS selected
             )
             SELECT unnest(rb_to_array(bm)) AS {partition_key} FROM rb_result WHERE bm IS NOT NULL"
        );
        Ok((Some(sql), existing.len()))
    }

    async fn set_cache_lazy(&self, key: Fingerprint, select_sql: &str, partition_key: &str) -> Result<bool> {
        reject_unsafe_lazy_sql(select_sql)?;
        let table = self.cache_table(partition_key);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys)
             SELECT $1, rb_build(array_agg(x)) FROM ({select_sql}) AS src(x)
             ON CONFLICT (query_hash) DO UPDATE SET partition_keys = excluded.partition_keys"
        ))
        .bind(key.to_hex())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_empty_bitmap_is_empty_set() {
        let empty = Bitmap::new();
        let bytes = empty.serialize();
        let decoded = PgRoaringBitmapCache::decode(&bytes);
        assert!(decoded.is_empty());
    }

    #[test]
    fn decode_round_trips_values() {
        let mut bm = Bitmap::new();
        bm.add(3);
        bm.add(9);
        bm.add(1001);
        let bytes = bm.serialize();
        let decoded = PgRoaringBitmapCache::decode(&bytes);
        let expected: IdentifierSet = [3i64, 9, 1001].into_iter().map(Identifier::Integer).collect();
        assert_eq!(decoded, expected);
    }
}
