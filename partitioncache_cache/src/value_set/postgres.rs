//! Value-set cache backend over a co-located PostgreSQL database (spec
//! §4.4 "Value-set (co-located, SQL-array)").
//!
//! Per partition key, identifiers are stored as a typed SQL array in a
//! dedicated `<prefix>_cache_<pk>` table; intersection is a multi-row
//! `array_agg`-then-intersect aggregate. This is the only backend that
//! supports all four scalar datatypes (geometry belongs to the spatial
//! backends, §4.4).

use crate::handler::{reject_unsafe_lazy_sql, CacheEntryMeta, CacheHandler, LazyCacheHandler};
use async_trait::async_trait;
use observability_deps::tracing::debug;
use partitioncache_time::{Time, TimeProviderRef};
use partitioncache_types::error::{DatatypeConflictSnafu, UnsupportedDatatypeSnafu};
use partitioncache_types::{
    datatype::Identifier, Error, Fingerprint, IdentifierSet, PartitionDatatype, QueryStatus, Result,
};
use snafu::ensure;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

const SUPPORTED: &[PartitionDatatype] = &[
    PartitionDatatype::Integer,
    PartitionDatatype::Float,
    PartitionDatatype::Text,
    PartitionDatatype::Timestamp,
];

/// SQL-array value-set cache, one table per partition key under a shared
/// table prefix.
#[derive(Debug)]
pub struct PgArrayCache {
    pool: PgPool,
    table_prefix: String,
    time_provider: TimeProviderRef,
    datatype_cache: RwLock<BTreeMap<String, PartitionDatatype>>,
}

impl PgArrayCache {
    /// Construct a handler over an existing pool. `register_partition_key`
    /// lazily creates the metadata/queries tables on first use (spec §3
    /// "Partition registry. ... Created lazily on first registration.").
    pub fn new(pool: PgPool, table_prefix: impl Into<String>, time_provider: TimeProviderRef) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.into(),
            time_provider,
            datatype_cache: RwLock::new(BTreeMap::new()),
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
                datatype TEXT NOT NULL CHECK (datatype IN ('integer','float','text','timestamp')),
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

    fn array_sql_type(datatype: PartitionDatatype) -> &'static str {
        match datatype {
            PartitionDatatype::Integer => "BIGINT[]",
            PartitionDatatype::Float => "DOUBLE PRECISION[]",
            PartitionDatatype::Text => "TEXT[]",
            PartitionDatatype::Timestamp => "BIGINT[]",
            PartitionDatatype::Geometry => unreachable!("rejected by supported_datatypes"),
        }
    }

    async fn ensure_cache_table(&self, partition_key: &str, datatype: PartitionDatatype) -> Result<()> {
        let table = self.cache_table(partition_key);
        let array_type = Self::array_sql_type(datatype);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                query_hash TEXT PRIMARY KEY,
                partition_keys {array_type},
                partition_keys_count INTEGER GENERATED ALWAYS AS (cardinality(partition_keys)) STORED
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn datatype_of(&self, partition_key: &str) -> Result<PartitionDatatype> {
        if let Some(dt) = self.datatype_cache.read().unwrap().get(partition_key).copied() {
            return Ok(dt);
        }
        let metadata = self.metadata_table();
        let row = sqlx::query(&format!(
            "SELECT datatype FROM {metadata} WHERE partition_key = $1"
        ))
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        let Some(row) = row else {
            return Err(Error::BackendMissing {
                partition_key: partition_key.to_string(),
            });
        };
        let text: String = row.try_get("datatype").map_err(transient)?;
        let dt: PartitionDatatype = text.parse().map_err(|_| Error::BackendMissing {
            partition_key: partition_key.to_string(),
        })?;
        self.datatype_cache
            .write()
            .unwrap()
            .insert(partition_key.to_string(), dt);
        Ok(dt)
    }

    fn identifiers_to_arrays(ids: &IdentifierSet, datatype: PartitionDatatype) -> ArrayParam {
        match datatype {
            PartitionDatatype::Integer => ArrayParam::I64(ids.iter().filter_map(Identifier::as_i64).collect()),
            PartitionDatatype::Float => ArrayParam::F64(
                ids.iter()
                    .filter_map(|i| match i {
                        Identifier::Float(f) => Some(*f),
                        _ => None,
                    })
                    .collect(),
            ),
            PartitionDatatype::Text => ArrayParam::Text(
                ids.iter()
                    .filter_map(|i| match i {
                        Identifier::Text(t) => Some(t.clone()),
                        _ => None,
                    })
                    .collect(),
            ),
            PartitionDatatype::Timestamp => ArrayParam::I64(
                ids.iter()
                    .filter_map(|i| match i {
                        Identifier::Timestamp(t) => Some(*t),
                        _ => None,
                    })
                    .collect(),
            ),
            PartitionDatatype::Geometry => unreachable!(),
        }
    }

    fn row_to_identifiers(row: &PgRow, datatype: PartitionDatatype) -> Result<Option<IdentifierSet>> {
        let values: Option<IdentifierSet> = match datatype {
            PartitionDatatype::Integer => {
                let v: Option<Vec<i64>> = row.try_get("partition_keys").map_err(transient)?;
                v.map(|v| v.into_iter().map(Identifier::Integer).collect())
            }
            PartitionDatatype::Float => {
                let v: Option<Vec<f64>> = row.try_get("partition_keys").map_err(transient)?;
                v.map(|v| v.into_iter().map(Identifier::Float).collect())
            }
            PartitionDatatype::Text => {
                let v: Option<Vec<String>> = row.try_get("partition_keys").map_err(transient)?;
                v.map(|v| v.into_iter().map(Identifier::Text).collect())
            }
            PartitionDatatype::Timestamp => {
                let v: Option<Vec<i64>> = row.try_get("partition_keys").map_err(transient)?;
                v.map(|v| v.into_iter().map(Identifier::Timestamp).collect())
            }
            PartitionDatatype::Geometry => unreachable!(),
        };
        Ok(values)
    }
}

enum ArrayParam {
    I64(Vec<i64>),
    F64(Vec<f64>),
    Text(Vec<String>),
}

fn transient(e: sqlx::Error) -> Error {
    Error::BackendTransient {
        message: e.to_string(),
    }
}

#[async_trait]
impl CacheHandler for PgArrayCache {
    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: PartitionDatatype,
        _bitsize: Option<u32>,
    ) -> Result<()> {
        ensure!(
            SUPPORTED.contains(&datatype),
            UnsupportedDatatypeSnafu { datatype }
        );
        self.ensure_scaffolding().await?;

        let metadata = self.metadata_table();
        if let Ok(existing) = self.datatype_of(partition_key).await {
            ensure!(
                existing == datatype,
                DatatypeConflictSnafu {
                    partition_key: partition_key.to_string(),
                    existing,
                    requested: datatype,
                }
            );
            return Ok(());
        }

        sqlx::query(&format!(
            "INSERT INTO {metadata} (partition_key, datatype) VALUES ($1, $2)
             ON CONFLICT (partition_key) DO NOTHING"
        ))
        .bind(partition_key)
        .bind(datatype.as_str())
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        self.ensure_cache_table(partition_key, datatype).await?;
        self.datatype_cache
            .write()
            .unwrap()
            .insert(partition_key.to_string(), datatype);
        debug!(partition_key, %datatype, "registered partition key");
        Ok(())
    }

    fn supported_datatypes(&self) -> &'static [PartitionDatatype] {
        SUPPORTED
    }

    async fn set_cache(&self, key: Fingerprint, identifiers: &IdentifierSet, partition_key: &str) -> Result<bool> {
        let datatype = self.datatype_of(partition_key).await?;
        let table = self.cache_table(partition_key);
        let query_hash = key.to_hex();

        let result = match Self::identifiers_to_arrays(identifiers, datatype) {
            ArrayParam::I64(v) => {
                sqlx::query(&format!(
                    "INSERT INTO {table} (query_hash, partition_keys) VALUES ($1, $2)
                     ON CONFLICT (query_hash) DO UPDATE SET partition_keys = $2"
                ))
                .bind(&query_hash)
                .bind(v)
                .execute(&self.pool)
                .await
            }
            ArrayParam::F64(v) => {
                sqlx::query(&format!(
                    "INSERT INTO {table} (query_hash, partition_keys) VALUES ($1, $2)
                     ON CONFLICT (query_hash) DO UPDATE SET partition_keys = $2"
                ))
                .bind(&query_hash)
                .bind(v)
                .execute(&self.pool)
                .await
            }
            ArrayParam::Text(v) => {
                sqlx::query(&format!(
                    "INSERT INTO {table} (query_hash, partition_keys) VALUES ($1, $2)
                     ON CONFLICT (query_hash) DO UPDATE SET partition_keys = $2"
                ))
                .bind(&query_hash)
                .bind(v)
                .execute(&self.pool)
                .await
            }
        };
        result.map_err(transient)?;
        Ok(true)
    }

    async fn get(&self, key: Fingerprint, partition_key: &str) -> Result<Option<IdentifierSet>> {
        let datatype = self.datatype_of(partition_key).await?;
        let table = self.cache_table(partition_key);
        let row = sqlx::query(&format!(
            "SELECT partition_keys FROM {table} WHERE query_hash = $1"
        ))
        .bind(key.to_hex())
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        match row {
            None => Ok(None),
            Some(row) => Self::row_to_identifiers(&row, datatype),
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
        let mut result: Option<IdentifierSet> = None;
        let mut hits = 0usize;
        for key in keys {
            let Some(set) = self.get(*key, partition_key).await? else {
                continue;
            };
            hits += 1;
            result = Some(match result {
                None => set,
                Some(acc) => acc.intersection(&set).cloned().collect(),
            });
        }
        Ok((result, hits))
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
        sqlx::query(&format!(
            "DELETE FROM {queries} WHERE query_hash = $1 AND partition_key = $2"
        ))
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
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
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
        self.datatype_cache.write().unwrap().remove(partition_key);
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
        let row = sqlx::query(&format!(
            "SELECT query FROM {queries} WHERE query_hash = $1 AND partition_key = $2"
        ))
        .bind(key.to_hex())
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.map(|r| r.try_get::<String, _>("query").unwrap_or_default()))
    }

    async fn get_all_queries(&self, partition_key: &str) -> Result<Vec<(Fingerprint, String)>> {
        let queries = self.queries_table();
        let rows = sqlx::query(&format!(
            "SELECT query_hash, query FROM {queries} WHERE partition_key = $1"
        ))
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
        let row = sqlx::query(&format!(
            "SELECT status FROM {queries} WHERE query_hash = $1 AND partition_key = $2"
        ))
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
        let rows = sqlx::query(&format!("SELECT partition_key, datatype FROM {metadata}"))
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let pk: String = row.try_get("partition_key").map_err(transient)?;
            let dt: String = row.try_get("datatype").map_err(transient)?;
            if let Ok(dt) = dt.parse() {
                out.push((pk, dt));
            }
        }
        Ok(out)
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
impl LazyCacheHandler for PgArrayCache {
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
        let hashes = existing
            .iter()
            .map(|k| format!("'{}'", k.to_hex()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT v AS id FROM (
                SELECT unnest(partition_keys) AS v, query_hash
                FROM {table} WHERE query_hash IN ({hashes}) AND partition_keys IS NOT NULL
            ) s
            GROUP BY v
            HAVING count(DISTINCT query_hash) = {count}",
            count = existing.len(),
        );
        Ok((Some(sql), existing.len()))
    }

    async fn set_cache_lazy(&self, key: Fingerprint, select_sql: &str, partition_key: &str) -> Result<bool> {
        reject_unsafe_lazy_sql(select_sql)?;
        let datatype = self.datatype_of(partition_key).await?;
        let table = self.cache_table(partition_key);
        let array_type = Self::array_sql_type(datatype);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys)
             SELECT $1, array_agg(x)::{array_type} FROM ({select_sql}) AS src(x)
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
    fn array_sql_type_matches_supported_datatypes() {
        for dt in SUPPORTED {
            assert!(!PgArrayCache::array_sql_type(*dt).is_empty());
        }
    }
}
