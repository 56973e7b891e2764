//! Fixed-width bit-vector cache over PostgreSQL.
//!
//! Each partition key owns a `<prefix>_cache_<pk>` table whose `bits`
//! column is a `BIT VARYING(n)`; identifier `i` is represented by the bit
//! at offset `i`. Intersection across fragments is `bit_and(bits)`, and
//! the per-row population count drives the "largest" eviction strategy
//! (spec §4.8).
//!
//! `n` is allocated lazily and only ever grows. Growing it while two
//! writers race to register the same, not-yet-existing partition key is
//! guarded by a Postgres advisory lock, bootstrapped with the bounded
//! poll-then-block protocol in [`partitioncache_backoff`] (spec §5).

use crate::handler::{reject_unsafe_lazy_sql, CacheEntryMeta, CacheHandler, LazyCacheHandler};
use async_trait::async_trait;
use observability_deps::tracing::{debug, info};
use partitioncache_backoff::{try_then_block_advisory_lock, AdvisoryLockOutcome};
use partitioncache_time::{Time, TimeProviderRef};
use partitioncache_types::error::UnsupportedDatatypeSnafu;
use partitioncache_types::{
    datatype::Identifier, Error, Fingerprint, IdentifierSet, PartitionDatatype, QueryStatus, Result,
};
use sha1::{Digest, Sha1};
use snafu::ensure;
use sqlx::{PgPool, Row};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::Duration;

const SUPPORTED: &[PartitionDatatype] = &[PartitionDatatype::Integer];

/// Default initial width allocated for a newly registered partition key.
const DEFAULT_BITSIZE: u32 = 1024;

/// Bit-vector cache over a co-located PostgreSQL database.
#[derive(Debug)]
pub struct PgBitVectorCache {
    pool: PgPool,
    table_prefix: String,
    time_provider: TimeProviderRef,
    /// Hard ceiling a partition key's bit-vector may grow to. `None` means
    /// unbounded growth.
    max_bitsize: Option<u32>,
    bitsize_cache: RwLock<BTreeMap<String, u32>>,
}

impl PgBitVectorCache {
    /// Construct a handler over an existing pool.
    pub fn new(
        pool: PgPool,
        table_prefix: impl Into<String>,
        time_provider: TimeProviderRef,
        max_bitsize: Option<u32>,
    ) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.into(),
            time_provider,
            max_bitsize,
            bitsize_cache: RwLock::new(BTreeMap::new()),
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

    async fn ensure_scaffolding(&self) -> Result<()> {
        let metadata = self.metadata_table();
        let queries = self.queries_table();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {metadata} (
                partition_key TEXT PRIMARY KEY,
                datatype TEXT NOT NULL CHECK (datatype IN ('integer')),
                bitsize INTEGER NOT NULL,
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
        Ok(())
    }

    async fn ensure_cache_table(&self, partition_key: &str, bitsize: u32) -> Result<()> {
        let table = self.cache_table(partition_key);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                query_hash TEXT PRIMARY KEY,
                bits BIT VARYING({bitsize}),
                popcount INTEGER GENERATED ALWAYS AS (length(replace(bits::text, '0', ''))) STORED
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn bitsize_of(&self, partition_key: &str) -> Result<u32> {
        if let Some(n) = self.bitsize_cache.read().unwrap().get(partition_key).copied() {
            return Ok(n);
        }
        let metadata = self.metadata_table();
        let row = sqlx::query(&format!("SELECT bitsize FROM {metadata} WHERE partition_key = $1"))
            .bind(partition_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        let Some(row) = row else {
            return Err(Error::BackendMissing {
                partition_key: partition_key.to_string(),
            });
        };
        let bitsize: i32 = row.try_get("bitsize").map_err(transient)?;
        let bitsize = bitsize as u32;
        self.bitsize_cache.write().unwrap().insert(partition_key.to_string(), bitsize);
        Ok(bitsize)
    }

    /// Grows the partition key's bit-vector to at least `required` bits if
    /// it isn't already that wide, under the advisory-lock protocol.
    async fn ensure_bitsize(&self, partition_key: &str, required: u32) -> Result<()> {
        let current = self.bitsize_of(partition_key).await?;
        if current >= required {
            return Ok(());
        }
        if let Some(max) = self.max_bitsize {
            ensure!(
                required <= max,
                partitioncache_types::error::DomainOverflowSnafu {
                    partition_key: partition_key.to_string(),
                    value: required as i64,
                    bitsize: current,
                }
            );
        }
        let target = required.next_power_of_two().max(DEFAULT_BITSIZE);
        let lock_id = advisory_lock_id(&self.table_prefix, partition_key);
        let mut lock_conn = self.pool.acquire().await.map_err(transient)?;

        let outcome = try_then_block_advisory_lock(
            20,
            Duration::from_millis(50),
            || async {
                sqlx::query("SELECT pg_try_advisory_lock($1)")
                    .bind(lock_id)
                    .fetch_one(&mut *lock_conn)
                    .await
                    .and_then(|row| row.try_get::<bool, _>(0))
                    .unwrap_or(false)
            },
            || false,
            || async {
                let _ = sqlx::query("SELECT pg_advisory_lock($1)")
                    .bind(lock_id)
                    .execute(&mut *lock_conn)
                    .await;
            },
        )
        .await;

        if matches!(outcome, AdvisoryLockOutcome::CompletedByOther) {
            self.bitsize_cache.write().unwrap().remove(partition_key);
            return Ok(());
        }

        let current = self.bitsize_of(partition_key).await.unwrap_or(0);
        if current < target {
            let table = self.cache_table(partition_key);
            sqlx::query(&format!(
                "ALTER TABLE {table} ALTER COLUMN bits TYPE BIT VARYING({target})
                 USING bits::bit varying({target})"
            ))
            .execute(&self.pool)
            .await
            .map_err(transient)?;
            let metadata = self.metadata_table();
            sqlx::query(&format!("UPDATE {metadata} SET bitsize = $1 WHERE partition_key = $2"))
                .bind(target as i32)
                .bind(partition_key)
                .execute(&self.pool)
                .await
                .map_err(transient)?;
            self.bitsize_cache.write().unwrap().insert(partition_key.to_string(), target);
            info!(partition_key, old_bitsize = current, new_bitsize = target, "grew bit-vector");
        }

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .execute(&mut *lock_conn)
            .await
            .map_err(transient)?;
        Ok(())
    }

    fn bits_literal(ids: &IdentifierSet, bitsize: u32) -> String {
        let mut bits = vec![b'0'; bitsize as usize];
        for id in ids {
            if let Some(v) = id.as_i64() {
                if v >= 0 && (v as u64) < bitsize as u64 {
                    bits[v as usize] = b'1';
                }
            }
        }
        format!("B'{}'", String::from_utf8(bits).unwrap())
    }

    fn decode_bits(text: &str) -> IdentifierSet {
        text.bytes()
            .enumerate()
            .filter(|(_, b)| *b == b'1')
            .map(|(i, _)| Identifier::Integer(i as i64))
            .collect()
    }
}

fn transient(e: sqlx::Error) -> Error {
    Error::BackendTransient {
        message: e.to_string(),
    }
}

/// Deterministic `pg_advisory_lock` id for bootstrapping/growing a
/// partition key's bit-vector, derived the same way fragment fingerprints
/// are: a stable hash of the identifying text, truncated to the 64 bits
/// an advisory lock id needs.
fn advisory_lock_id(table_prefix: &str, partition_key: &str) -> i64 {
    let mut hasher = Sha1::new();
    hasher.update(table_prefix.as_bytes());
    hasher.update(b":");
    hasher.update(partition_key.as_bytes());
    let digest = hasher.finalize();
    i64::from_be_bytes(digest[0..8].try_into().unwrap())
}

#[async_trait]
impl CacheHandler for PgBitVectorCache {
    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: PartitionDatatype,
        bitsize: Option<u32>,
    ) -> Result<()> {
        ensure!(SUPPORTED.contains(&datatype), UnsupportedDatatypeSnafu { datatype });
        self.ensure_scaffolding().await?;

        let metadata = self.metadata_table();
        if let Ok(existing) = self.bitsize_of(partition_key).await {
            let _ = existing;
            return Ok(());
        }

        let initial = bitsize.unwrap_or(DEFAULT_BITSIZE).max(1);
        sqlx::query(&format!(
            "INSERT INTO {metadata} (partition_key, datatype, bitsize) VALUES ($1, 'integer', $2)
             ON CONFLICT (partition_key) DO NOTHING"
        ))
        .bind(partition_key)
        .bind(initial as i32)
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        // Re-read: another writer may have raced us to the INSERT and
        // won with a different initial size.
        let actual = self.bitsize_of(partition_key).await?;
        self.ensure_cache_table(partition_key, actual).await?;
        debug!(partition_key, bitsize = actual, "registered bit-vector partition key");
        Ok(())
    }

    fn supported_datatypes(&self) -> &'static [PartitionDatatype] {
        SUPPORTED
    }

    async fn set_cache(&self, key: Fingerprint, identifiers: &IdentifierSet, partition_key: &str) -> Result<bool> {
        let max_id = identifiers.iter().filter_map(Identifier::as_i64).max().unwrap_or(0);
        if max_id >= 0 {
            self.ensure_bitsize(partition_key, max_id as u32 + 1).await?;
        }
        let bitsize = self.bitsize_of(partition_key).await?;
        let table = self.cache_table(partition_key);
        let literal = Self::bits_literal(identifiers, bitsize);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, bits) VALUES ($1, {literal})
             ON CONFLICT (query_hash) DO UPDATE SET bits = {literal}"
        ))
        .bind(key.to_hex())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }

    async fn get(&self, key: Fingerprint, partition_key: &str) -> Result<Option<IdentifierSet>> {
        let table = self.cache_table(partition_key);
        let row = sqlx::query(&format!("SELECT bits::text AS bits FROM {table} WHERE query_hash = $1"))
            .bind(key.to_hex())
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let text: Option<String> = row.try_get("bits").map_err(transient)?;
                Ok(text.map(|t| Self::decode_bits(&t)))
            }
        }
    }

    async fn set_null(&self, key: Fingerprint, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, bits) VALUES ($1, NULL)
             ON CONFLICT (query_hash) DO UPDATE SET bits = NULL"
        ))
        .bind(key.to_hex())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }

    async fn is_null(&self, key: Fingerprint, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        let row = sqlx::query(&format!("SELECT bits IS NULL AS is_null FROM {table} WHERE query_hash = $1"))
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
            "SELECT bit_and(bits)::text AS bits FROM {table} WHERE query_hash IN ({hashes}) AND bits IS NOT NULL"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        let set = row
            .and_then(|r| r.try_get::<Option<String>, _>("bits").ok().flatten())
            .map(|t| Self::decode_bits(&t));
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
        self.bitsize_cache.write().unwrap().remove(partition_key);
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
            "SELECT c.query_hash, c.popcount, q.status, q.last_seen
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
            let popcount: Option<i32> = row.try_get("popcount").map_err(transient)?;
            let status: Option<String> = row.try_get("status").map_err(transient)?;
            let last_seen: Option<chrono::DateTime<chrono::Utc>> = row.try_get("last_seen").map_err(transient)?;
            out.push(CacheEntryMeta {
                fingerprint,
                last_seen: last_seen.map(Time::new).unwrap_or_else(|| self.time_provider.now()),
                cardinality: popcount.map(|c| c as usize),
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
impl LazyCacheHandler for PgBitVectorCache {
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
            "SELECT n AS id FROM generate_series(0, bit_length(agg.bits) - 1) AS n,
                (SELECT bit_and(bits) AS bits FROM {table} WHERE query_hash IN ({hashes}) AND bits IS NOT NULL) agg
             WHERE get_bit(agg.bits, n) = 1"
        );
        Ok((Some(sql), existing.len()))
    }

    async fn set_cache_lazy(&self, key: Fingerprint, select_sql: &str, partition_key: &str) -> Result<bool> {
        reject_unsafe_lazy_sql(select_sql)?;
        let bitsize = self.bitsize_of(partition_key).await?;
        let table = self.cache_table(partition_key);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, bits)
             SELECT $1, coalesce(bit_or(set_bit(B'{zero}'::bit varying({bitsize}), x, 1)), B'{zero}'::bit varying({bitsize}))
             FROM ({select_sql}) AS src(x)
             ON CONFLICT (query_hash) DO UPDATE SET bits = excluded.bits",
            zero = "0".repeat(bitsize as usize),
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
    fn bits_literal_round_trips_through_decode() {
        let mut ids = IdentifierSet::new();
        ids.insert(Identifier::Integer(3));
        ids.insert(Identifier::Integer(9));
        let literal = PgBitVectorCache::bits_literal(&ids, 16);
        let text = literal.trim_start_matches("B'").trim_end_matches('\'');
        let decoded = PgBitVectorCache::decode_bits(text);
        assert_eq!(decoded, ids);
    }

    #[test]
    fn advisory_lock_id_is_stable_per_partition_key() {
        let a = advisory_lock_id("pc", "zip_code");
        let b = advisory_lock_id("pc", "zip_code");
        let c = advisory_lock_id("pc", "other_key");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
