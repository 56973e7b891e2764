//! The cache handler contract every storage backend implements (spec
//! §4.3) and the optional lazy/spatial capability extensions.
//!
//! `CacheHandler` is the eager, universal contract: every backend can
//! materialise an [`IdentifierSet`] in the application. Backends that can
//! additionally express set operations as SQL opt into [`LazyCacheHandler`];
//! the two spatial backends further opt into [`SpatialCacheHandler`]. The
//! apply-cache rewriter (`partitioncache_rewrite`) selects between these
//! through [`CacheHandler::as_lazy`]/[`CacheHandler::as_spatial`], mirroring
//! spec §9 "lazy-vs-eager interface duality: two trait/interface variants,
//! with eager being universal and lazy being an optional capability that
//! backends opt into".

use async_trait::async_trait;
use partitioncache_time::Time;
use partitioncache_types::{Error, Fingerprint, IdentifierSet, PartitionDatatype, QueryStatus, Result};
use std::any::Any;
use std::collections::BTreeSet;

/// One row of a partition's query metadata, as surfaced to the
/// maintenance component (spec §4.8). This is the only view maintenance
/// operations are allowed to use — "all maintenance operations run at
/// the cache-handler interface; no maintenance path bypasses a
/// handler's contract".
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryMeta {
    /// The fragment fingerprint this row describes.
    pub fingerprint: Fingerprint,
    /// Last time the fragment's execution was (re-)confirmed current.
    pub last_seen: Time,
    /// Cardinality of the stored identifier set, or `None` for a NULL
    /// (unusable) entry.
    pub cardinality: Option<usize>,
    /// Outcome of the fragment's last execution.
    pub status: QueryStatus,
}

/// The eager cache handler contract (spec §4.3).
///
/// Implementations own a `(fingerprint, partition_key)` keyed namespace
/// per backend; nothing outside a handler implementation may mutate the
/// tables/keys it owns (spec §3 "Ownership").
#[async_trait]
pub trait CacheHandler: std::fmt::Debug + Send + Sync {
    /// Idempotently register `pk` with `datatype`. Fails with
    /// [`Error::DatatypeConflict`] if already registered with a different
    /// datatype, or [`Error::UnsupportedDatatype`] if this backend can't
    /// represent `datatype`. `bitsize` is consulted only by the
    /// bit-vector backend and otherwise ignored.
    async fn register_partition_key(
        &self,
        partition_key: &str,
        datatype: PartitionDatatype,
        bitsize: Option<u32>,
    ) -> Result<()>;

    /// The datatypes this backend can store, fixed at compile time.
    fn supported_datatypes(&self) -> &'static [PartitionDatatype];

    /// Overwrite or insert the identifier set for `key`.
    async fn set_cache(&self, key: Fingerprint, identifiers: &IdentifierSet, partition_key: &str) -> Result<bool>;

    /// The stored identifier set, or `None` if absent or NULL.
    async fn get(&self, key: Fingerprint, partition_key: &str) -> Result<Option<IdentifierSet>>;

    /// Mark `key` as the NULL sentinel: executed, but unusable.
    async fn set_null(&self, key: Fingerprint, partition_key: &str) -> Result<bool>;

    /// Whether `key` is the NULL sentinel.
    async fn is_null(&self, key: Fingerprint, partition_key: &str) -> Result<bool>;

    /// Whether a cache entry exists for `key`. When `check_query` is
    /// true, also requires a metadata row with status [`QueryStatus::Ok`]
    /// — a NULL entry is "present" but never "usable".
    async fn exists(&self, key: Fingerprint, partition_key: &str, check_query: bool) -> Result<bool>;

    /// The subset of `keys` present under `partition_key`.
    async fn filter_existing_keys(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
        check_query: bool,
    ) -> Result<BTreeSet<Fingerprint>>;

    /// Set intersection across every present, non-NULL entry in `keys`,
    /// plus the number of entries that contributed to it (spec §8
    /// "`get_intersected`").
    async fn get_intersected(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
    ) -> Result<(Option<IdentifierSet>, usize)>;

    /// Delete a single entry (cache + metadata row).
    async fn delete(&self, key: Fingerprint, partition_key: &str) -> Result<bool>;

    /// Drop every entry, metadata row, and the registry record for
    /// `partition_key`, atomically.
    async fn delete_partition(&self, partition_key: &str) -> Result<bool>;

    /// Store the fragment's SQL text as metadata alongside its cache
    /// entry.
    async fn set_query(&self, key: Fingerprint, fragment_sql: &str, partition_key: &str) -> Result<bool>;

    /// The stored fragment SQL text, if any.
    async fn get_query(&self, key: Fingerprint, partition_key: &str) -> Result<Option<String>>;

    /// Every `(fingerprint, fragment_sql)` pair stored for `partition_key`.
    async fn get_all_queries(&self, partition_key: &str) -> Result<Vec<(Fingerprint, String)>>;

    /// Update the status of a query-metadata row, touching `last_seen`.
    async fn set_query_status(&self, key: Fingerprint, partition_key: &str, status: QueryStatus) -> Result<bool>;

    /// The stored status of a query-metadata row, if any.
    async fn get_query_status(&self, key: Fingerprint, partition_key: &str) -> Result<Option<QueryStatus>>;

    /// Every fingerprint with an entry under `partition_key`.
    async fn get_all_keys(&self, partition_key: &str) -> Result<Vec<Fingerprint>>;

    /// Every registered partition key and its datatype.
    async fn get_partition_keys(&self) -> Result<Vec<(String, PartitionDatatype)>>;

    /// Every metadata row for `partition_key`, for use by the
    /// maintenance component (spec §4.8). Implementations derive
    /// `cardinality`/`status` from whatever representation they use
    /// internally (an explicit column, or the dual sentinel keys).
    async fn list_entries(&self, partition_key: &str) -> Result<Vec<CacheEntryMeta>>;

    /// Release any held resources (connections, pools). Idempotent.
    async fn close(&self) -> Result<()>;

    /// Upcast to `&dyn Any`, kept for completeness alongside the
    /// capability accessors below; nothing in this workspace downcasts
    /// to a concrete backend type.
    fn as_any(&self) -> &dyn Any;

    /// Upcast to the optional [`LazyCacheHandler`] capability. Rust has
    /// no built-in trait-object upcasting, so every backend that
    /// implements `LazyCacheHandler` overrides this to return `Some(self)`;
    /// the default covers backends that don't (spec §9 "lazy-vs-eager
    /// interface duality").
    fn as_lazy(&self) -> Option<&dyn LazyCacheHandler> {
        None
    }

    /// Upcast to the optional [`SpatialCacheHandler`] capability, by the
    /// same mechanism as [`Self::as_lazy`].
    fn as_spatial(&self) -> Option<&dyn SpatialCacheHandler> {
        None
    }

    /// High-level helper combining a cache write with its query
    /// metadata (spec Appendix C, `abstract.py`'s `set_entry`):
    /// atomically writes the cache entry (or `set_null` when
    /// `identifiers` is `None`) and the fragment text together. Skips
    /// the cache write — touching only metadata's `last_seen` — when an
    /// `ok` entry already exists and `force_update` is `false`, so
    /// repeated population sweeps over already-cached fragments don't
    /// re-execute work the worker pool already skipped.
    async fn set_entry(
        &self,
        key: Fingerprint,
        partition_key: &str,
        identifiers: Option<&IdentifierSet>,
        fragment_sql: &str,
        status: QueryStatus,
        force_update: bool,
    ) -> Result<()> {
        if !force_update && self.exists(key, partition_key, true).await? {
            self.set_query_status(key, partition_key, status).await?;
            return Ok(());
        }
        match identifiers {
            Some(ids) => {
                self.set_cache(key, ids, partition_key).await?;
            }
            None => {
                self.set_null(key, partition_key).await?;
            }
        }
        self.set_query(key, fragment_sql, partition_key).await?;
        self.set_query_status(key, partition_key, status).await?;
        Ok(())
    }
}

/// Optional capability: backends that can express set intersection as a
/// SQL expression opt into this so the rewriter can splice the
/// intersection into a new query by reference instead of materialising
/// it in the application first (spec §4.3 "lazy contract").
#[async_trait]
pub trait LazyCacheHandler: CacheHandler {
    /// A `SELECT` expression whose rows are the identifiers in the
    /// intersection of `keys`, safely embeddable as a subquery or
    /// temporary-table source, plus the hit count.
    async fn get_intersected_lazy(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
    ) -> Result<(Option<String>, usize)>;

    /// Execute `select_sql` directly in the backend and store its
    /// result as the cache entry for `key`, without round-tripping
    /// identifiers through the application.
    ///
    /// Refuses (returns [`Error::UnsafeLazyQuery`]) any `select_sql`
    /// containing a DDL or `DELETE` keyword.
    async fn set_cache_lazy(&self, key: Fingerprint, select_sql: &str, partition_key: &str) -> Result<bool>;
}

/// A persisted spatial filter: Well-Known Binary geometry plus the SRID
/// it was authored in (spec §6 "Persisted spatial filter format").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialFilter {
    /// WKB-encoded geometry (a polygon or multipolygon union).
    pub wkb: Vec<u8>,
    /// Spatial reference system identifier.
    pub srid: i32,
}

/// Optional capability implemented by the two spatial backends (spec
/// §4.3 "Spatial backends extend the lazy contract").
#[async_trait]
pub trait SpatialCacheHandler: LazyCacheHandler {
    /// The union of every matching fragment's geometry, buffered by
    /// `buffer_distance`, as a materialised [`SpatialFilter`].
    async fn get_spatial_filter(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
        buffer_distance: f64,
    ) -> Result<Option<SpatialFilter>>;

    /// The same filter, expressed lazily as a SQL expression producing
    /// the buffered geometry, plus its SRID.
    async fn get_spatial_filter_lazy(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
        buffer_distance: f64,
    ) -> Result<Option<(String, i32)>>;
}

/// Rejects `sql` if it contains DDL or `DELETE` keywords (spec §4.3
/// "Implementations MUST refuse any input containing DDL or deletion
/// statements", §7 `UnsafeLazyQuery`). A conservative keyword scan, not
/// a parser: `set_cache_lazy` only ever needs to run a `SELECT`, so
/// rejecting anything that merely contains one of these tokens is safe
/// and cheap.
pub fn reject_unsafe_lazy_sql(sql: &str) -> Result<()> {
    const FORBIDDEN: &[&str] = &[
        "drop ", "alter ", "truncate ", "delete ", "insert ", "update ", "create ", "grant ", "revoke ",
    ];
    let lower = format!(" {} ", sql.to_ascii_lowercase());
    for word in FORBIDDEN {
        if lower.contains(word) {
            return Err(Error::UnsafeLazyQuery {
                reason: format!("query contains forbidden keyword '{}'", word.trim()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ddl_and_delete() {
        assert!(reject_unsafe_lazy_sql("SELECT id FROM cache_zip").is_ok());
        assert!(reject_unsafe_lazy_sql("DROP TABLE cache_zip").is_err());
        assert!(reject_unsafe_lazy_sql("DELETE FROM cache_zip").is_err());
        assert!(reject_unsafe_lazy_sql("SELECT id FROM t; UPDATE t SET x=1").is_err());
    }
}
