//! Value-set cache backend over an external Redis key-value store (spec
//! §4.4 "Value-set (external key-value)").
//!
//! Unlike the co-located backends, Redis has no schema to hang an
//! explicit `status` column off, so termination state is carried by the
//! dual sentinel keys described in spec §3 "Query-metadata entry" and
//! supplemented in `SPEC_FULL.md` Appendix C (`redis_abstract.py`'s
//! pattern): `_LIMIT_<fp>` and `_TIMEOUT_<fp>`, scoped per partition key.

use crate::handler::{CacheEntryMeta, CacheHandler, LazyCacheHandler};
use async_trait::async_trait;
use deadpool_redis::{redis::AsyncCommands, Pool};
use partitioncache_time::{Time, TimeProviderRef};
use partitioncache_types::error::{DatatypeConflictSnafu, UnsupportedDatatypeSnafu};
use partitioncache_types::{
    datatype::Identifier, Error, Fingerprint, IdentifierSet, PartitionDatatype, QueryStatus, Result,
};
use serde::{Deserialize, Serialize};
use snafu::ensure;
use std::any::Any;
use std::collections::BTreeSet;

const SUPPORTED: &[PartitionDatatype] = &[
    PartitionDatatype::Integer,
    PartitionDatatype::Float,
    PartitionDatatype::Text,
    PartitionDatatype::Timestamp,
];

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentifiers {
    datatype: PartitionDatatype,
    values: Vec<StoredValue>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredQuery {
    fragment_sql: String,
    last_seen_millis: i64,
}

/// Redis-backed value-set cache.
#[derive(Debug)]
pub struct RedisCache {
    pool: Pool,
    time_provider: TimeProviderRef,
}

impl RedisCache {
    /// Construct a handler over an existing connection pool.
    pub fn new(pool: Pool, time_provider: TimeProviderRef) -> Self {
        Self { pool, time_provider }
    }

    fn cache_key(partition_key: &str, fp: Fingerprint) -> String {
        format!("cache:{partition_key}:{fp}")
    }

    fn metadata_key(partition_key: &str) -> String {
        format!("_partition_metadata:{partition_key}")
    }

    fn query_key(partition_key: &str, fp: Fingerprint) -> String {
        format!("query:{partition_key}:{fp}")
    }

    fn limit_key(partition_key: &str, fp: Fingerprint) -> String {
        format!("_LIMIT_{partition_key}:{fp}")
    }

    fn timeout_key(partition_key: &str, fp: Fingerprint) -> String {
        format!("_TIMEOUT_{partition_key}:{fp}")
    }

    fn all_keys_index(partition_key: &str) -> String {
        format!("_keys:{partition_key}")
    }

    fn registry_index() -> &'static str {
        "_partition_keys"
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| Error::BackendTransient {
            message: e.to_string(),
        })
    }
}

fn transient(e: deadpool_redis::redis::RedisError) -> Error {
    Error::BackendTransient {
        message: e.to_string(),
    }
}

fn encode(identifiers: &IdentifierSet, datatype: PartitionDatatype) -> String {
    let values = identifiers
        .iter()
        .filter_map(|id| match (id, datatype) {
            (Identifier::Integer(v), PartitionDatatype::Integer) => Some(StoredValue::Integer(*v)),
            (Identifier::Float(v), PartitionDatatype::Float) => Some(StoredValue::Float(*v)),
            (Identifier::Text(v), PartitionDatatype::Text) => Some(StoredValue::Text(v.clone())),
            (Identifier::Timestamp(v), PartitionDatatype::Timestamp) => Some(StoredValue::Integer(*v)),
            _ => None,
        })
        .collect();
    serde_json::to_string(&StoredIdentifiers { datatype, values }).expect("identifier set serialises")
}

fn decode(raw: &str) -> Option<IdentifierSet> {
    let stored: StoredIdentifiers = serde_json::from_str(raw).ok()?;
    Some(
        stored
            .values
            .into_iter()
            .map(|v| match (v, stored.datatype) {
                (StoredValue::Integer(i), PartitionDatatype::Timestamp) => Identifier::Timestamp(i),
                (StoredValue::Integer(i), _) => Identifier::Integer(i),
                (StoredValue::Float(f), _) => Identifier::Float(f),
                (StoredValue::Text(t), _) => Identifier::Text(t),
            })
            .collect(),
    )
}

#[async_trait]
impl CacheHandler for RedisCache {
    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: PartitionDatatype,
        _bitsize: Option<u32>,
    ) -> Result<()> {
        ensure!(SUPPORTED.contains(&datatype), UnsupportedDatatypeSnafu { datatype });
        let mut conn = self.conn().await?;
        let key = Self::metadata_key(partition_key);
        let existing: Option<String> = conn.get(&key).await.map_err(transient)?;
        match existing {
            Some(text) => {
                let existing: PartitionDatatype = text.parse().map_err(|_| Error::BackendTransient {
                    message: format!("corrupt metadata for partition key '{partition_key}'"),
                })?;
                ensure!(
                    existing == datatype,
                    DatatypeConflictSnafu {
                        partition_key: partition_key.to_string(),
                        existing,
                        requested: datatype,
                    }
                );
            }
            None => {
                let _: () = conn.set(&key, datatype.as_str()).await.map_err(transient)?;
                let _: () = conn
                    .sadd(Self::registry_index(), partition_key)
                    .await
                    .map_err(transient)?;
            }
        }
        Ok(())
    }

    fn supported_datatypes(&self) -> &'static [PartitionDatatype] {
        SUPPORTED
    }

    async fn set_cache(&self, key: Fingerprint, identifiers: &IdentifierSet, partition_key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let datatype: String = conn
            .get(Self::metadata_key(partition_key))
            .await
            .map_err(transient)?;
        let datatype: PartitionDatatype = datatype.parse().map_err(|_| Error::BackendMissing {
            partition_key: partition_key.to_string(),
        })?;
        let encoded = encode(identifiers, datatype);
        let _: () = conn.set(Self::cache_key(partition_key, key), encoded).await.map_err(transient)?;
        let _: () = conn
            .sadd(Self::all_keys_index(partition_key), key.to_hex())
            .await
            .map_err(transient)?;
        Ok(true)
    }

    async fn get(&self, key: Fingerprint, partition_key: &str) -> Result<Option<IdentifierSet>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(Self::cache_key(partition_key, key)).await.map_err(transient)?;
        Ok(raw.and_then(|r| decode(&r)))
    }

    async fn set_null(&self, key: Fingerprint, partition_key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(Self::cache_key(partition_key, key)).await.map_err(transient)?;
        let _: () = conn
            .sadd(Self::all_keys_index(partition_key), key.to_hex())
            .await
            .map_err(transient)?;
        Ok(true)
    }

    async fn is_null(&self, key: Fingerprint, partition_key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let has_cache: bool = conn.exists(Self::cache_key(partition_key, key)).await.map_err(transient)?;
        if has_cache {
            return Ok(false);
        }
        let limit: bool = conn.exists(Self::limit_key(partition_key, key)).await.map_err(transient)?;
        let timeout: bool = conn.exists(Self::timeout_key(partition_key, key)).await.map_err(transient)?;
        Ok(limit || timeout)
    }

    async fn exists(&self, key: Fingerprint, partition_key: &str, check_query: bool) -> Result<bool> {
        let mut conn = self.conn().await?;
        let is_member: bool = conn
            .sismember(Self::all_keys_index(partition_key), key.to_hex())
            .await
            .map_err(transient)?;
        if !is_member {
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
        let mut conn = self.conn().await?;
        let _: () = conn.del(Self::cache_key(partition_key, key)).await.map_err(transient)?;
        let _: () = conn.del(Self::query_key(partition_key, key)).await.map_err(transient)?;
        let _: () = conn.del(Self::limit_key(partition_key, key)).await.map_err(transient)?;
        let _: () = conn.del(Self::timeout_key(partition_key, key)).await.map_err(transient)?;
        let _: () = conn
            .srem(Self::all_keys_index(partition_key), key.to_hex())
            .await
            .map_err(transient)?;
        Ok(true)
    }

    async fn delete_partition(&self, partition_key: &str) -> Result<bool> {
        let keys = self.get_all_keys(partition_key).await?;
        for key in keys {
            self.delete(key, partition_key).await?;
        }
        let mut conn = self.conn().await?;
        let _: () = conn.del(Self::all_keys_index(partition_key)).await.map_err(transient)?;
        let _: () = conn.del(Self::metadata_key(partition_key)).await.map_err(transient)?;
        let _: () = conn.srem(Self::registry_index(), partition_key).await.map_err(transient)?;
        Ok(true)
    }

    async fn set_query(&self, key: Fingerprint, fragment_sql: &str, partition_key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let stored = StoredQuery {
            fragment_sql: fragment_sql.to_string(),
            last_seen_millis: self.time_provider.now().date_time().timestamp_millis(),
        };
        let encoded = serde_json::to_string(&stored).expect("query metadata serialises");
        let _: () = conn.set(Self::query_key(partition_key, key), encoded).await.map_err(transient)?;
        Ok(true)
    }

    async fn get_query(&self, key: Fingerprint, partition_key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(Self::query_key(partition_key, key)).await.map_err(transient)?;
        Ok(raw
            .and_then(|r| serde_json::from_str::<StoredQuery>(&r).ok())
            .map(|q| q.fragment_sql))
    }

    async fn get_all_queries(&self, partition_key: &str) -> Result<Vec<(Fingerprint, String)>> {
        let mut out = Vec::new();
        for key in self.get_all_keys(partition_key).await? {
            if let Some(text) = self.get_query(key, partition_key).await? {
                out.push((key, text));
            }
        }
        Ok(out)
    }

    async fn set_query_status(&self, key: Fingerprint, partition_key: &str, status: QueryStatus) -> Result<bool> {
        let mut conn = self.conn().await?;
        let (limit, timeout) = (Self::limit_key(partition_key, key), Self::timeout_key(partition_key, key));
        match status {
            QueryStatus::Ok => {
                let _: () = conn.del(&limit).await.map_err(transient)?;
                let _: () = conn.del(&timeout).await.map_err(transient)?;
            }
            QueryStatus::Failed => {
                let _: () = conn.set(&limit, "1").await.map_err(transient)?;
                let _: () = conn.del(&timeout).await.map_err(transient)?;
            }
            QueryStatus::Timeout => {
                let _: () = conn.set(&timeout, "1").await.map_err(transient)?;
                let _: () = conn.del(&limit).await.map_err(transient)?;
            }
        }
        let _: () = conn
            .sadd(Self::all_keys_index(partition_key), key.to_hex())
            .await
            .map_err(transient)?;
        Ok(true)
    }

    async fn get_query_status(&self, key: Fingerprint, partition_key: &str) -> Result<Option<QueryStatus>> {
        let mut conn = self.conn().await?;
        let limit: bool = conn.exists(Self::limit_key(partition_key, key)).await.map_err(transient)?;
        if limit {
            return Ok(Some(QueryStatus::Failed));
        }
        let timeout: bool = conn.exists(Self::timeout_key(partition_key, key)).await.map_err(transient)?;
        if timeout {
            return Ok(Some(QueryStatus::Timeout));
        }
        let is_member: bool = conn
            .sismember(Self::all_keys_index(partition_key), key.to_hex())
            .await
            .map_err(transient)?;
        Ok(is_member.then_some(QueryStatus::Ok))
    }

    async fn get_all_keys(&self, partition_key: &str) -> Result<Vec<Fingerprint>> {
        let mut conn = self.conn().await?;
        let hashes: Vec<String> = conn
            .smembers(Self::all_keys_index(partition_key))
            .await
            .map_err(transient)?;
        Ok(hashes.into_iter().filter_map(|h| h.parse().ok()).collect())
    }

    async fn get_partition_keys(&self) -> Result<Vec<(String, PartitionDatatype)>> {
        let mut conn = self.conn().await?;
        let pks: Vec<String> = conn.smembers(Self::registry_index()).await.map_err(transient)?;
        let mut out = Vec::with_capacity(pks.len());
        for pk in pks {
            let datatype: Option<String> = conn.get(Self::metadata_key(&pk)).await.map_err(transient)?;
            if let Some(dt) = datatype.and_then(|d| d.parse().ok()) {
                out.push((pk, dt));
            }
        }
        Ok(out)
    }

    async fn list_entries(&self, partition_key: &str) -> Result<Vec<CacheEntryMeta>> {
        let mut out = Vec::new();
        for key in self.get_all_keys(partition_key).await? {
            let status = self.get_query_status(key, partition_key).await?.unwrap_or(QueryStatus::Ok);
            let cardinality = self.get(key, partition_key).await?.map(|s| s.len());
            let mut conn = self.conn().await?;
            let raw: Option<String> = conn.get(Self::query_key(partition_key, key)).await.map_err(transient)?;
            let last_seen = raw
                .and_then(|r| serde_json::from_str::<StoredQuery>(&r).ok())
                .map(|q| Time::from_timestamp_millis(q.last_seen_millis))
                .unwrap_or_else(|| self.time_provider.now());
            out.push(CacheEntryMeta {
                fingerprint: key,
                last_seen,
                cardinality,
                status,
            });
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
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
impl LazyCacheHandler for RedisCache {
    async fn get_intersected_lazy(
        &self,
        _keys: &[Fingerprint],
        _partition_key: &str,
    ) -> Result<(Option<String>, usize)> {
        // Redis has no SQL engine to splice into: this backend only
        // supports the eager contract.
        Ok((None, 0))
    }

    async fn set_cache_lazy(&self, _key: Fingerprint, _select_sql: &str, _partition_key: &str) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_integers() {
        let mut set = IdentifierSet::new();
        set.insert(Identifier::Integer(1001));
        set.insert(Identifier::Integer(1002));
        let encoded = encode(&set, PartitionDatatype::Integer);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn encode_decode_round_trips_text() {
        let mut set = IdentifierSet::new();
        set.insert(Identifier::Text("a".into()));
        set.insert(Identifier::Text("b".into()));
        let encoded = encode(&set, PartitionDatatype::Text);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, set);
    }
}
