//! H3 tessellation spatial backend (spec §4.4 "Spatial tessellation
//! (H3)").
//!
//! The identifier domain is the set of fixed-resolution H3 cell indices
//! covering each fragment's rows, stored the same way
//! [`crate::value_set::postgres::PgArrayCache`] stores an integer
//! domain: a `BIGINT[]` column per partition key. What distinguishes
//! this backend is the extra [`crate::handler::SpatialCacheHandler`]
//! capability: it can turn a set of cell indices back into the union of
//! their boundary polygons, via [`h3o`], for splicing into an
//! `ST_DWithin` predicate.

use crate::handler::{reject_unsafe_lazy_sql, CacheEntryMeta, CacheHandler, LazyCacheHandler, SpatialCacheHandler, SpatialFilter};
use crate::spatial::wkb;
use async_trait::async_trait;
use h3o::CellIndex;
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

/// H3 cell-set cache over a co-located PostgreSQL database.
#[derive(Debug)]
pub struct H3SpatialCache {
    pool: PgPool,
    table_prefix: String,
    time_provider: TimeProviderRef,
    srid: i32,
    /// Approximate edge length, in the units of `srid`'s coordinate
    /// system, of cells at this backend's resolution — used as the
    /// default dilation amount the way spec §4.4 describes ("buffered
    /// by one cell edge length").
    edge_length: f64,
}

impl H3SpatialCache {
    /// Construct a handler over an existing pool.
    pub fn new(pool: PgPool, table_prefix: impl Into<String>, time_provider: TimeProviderRef, srid: i32, edge_length: f64) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.into(),
            time_provider,
            srid,
            edge_length,
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
                partition_keys BIGINT[],
                partition_keys_count INTEGER GENERATED ALWAYS AS (cardinality(partition_keys)) STORED
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    fn ids_to_i64s(identifiers: &IdentifierSet) -> Vec<i64> {
        identifiers.iter().filter_map(Identifier::as_i64).collect()
    }

    fn decode(values: &[i64]) -> IdentifierSet {
        values.iter().map(|v| Identifier::Integer(*v)).collect()
    }

    /// The boundary ring of a single H3 cell, as `(lng, lat)` pairs in
    /// degrees — the coordinate order `ST_GeomFromWKB` expects for a
    /// geographic SRID.
    fn cell_ring(cell: CellIndex) -> Vec<(f64, f64)> {
        let mut ring: Vec<(f64, f64)> = cell.boundary().iter().map(|ll| (ll.lng_radians().to_degrees(), ll.lat_radians().to_degrees())).collect();
        if let Some(first) = ring.first().copied() {
            ring.push(first);
        }
        ring
    }
}

fn transient(e: sqlx::Error) -> Error {
    Error::BackendTransient {
        message: e.to_string(),
    }
}

#[async_trait]
impl CacheHandler for H3SpatialCache {
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
        debug!(partition_key, "registered H3 spatial partition key");
        Ok(())
    }

    fn supported_datatypes(&self) -> &'static [PartitionDatatype] {
        SUPPORTED
    }

    async fn set_cache(&self, key: Fingerprint, identifiers: &IdentifierSet, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        let values = Self::ids_to_i64s(identifiers);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys) VALUES ($1, $2)
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
        let row = sqlx::query(&format!("SELECT partition_keys FROM {table} WHERE query_hash = $1"))
            .bind(key.to_hex())
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let values: Option<Vec<i64>> = row.try_get("partition_keys").map_err(transient)?;
                Ok(values.map(|v| Self::decode(&v)))
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
            "SELECT array_agg(DISTINCT v) AS cells FROM (
                SELECT unnest(partition_keys) AS v, query_hash FROM {table} WHERE query_hash IN ({hashes})
             ) AS cells
             WHERE v IN (
                SELECT unnest(partition_keys) FROM {table} WHERE query_hash IN ({hashes})
                GROUP BY unnest(partition_keys) HAVING count(DISTINCT query_hash) = {n}
             )",
            n = existing.len(),
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        let set = row
            .and_then(|r| r.try_get::<Option<Vec<i64>>, _>("cells").ok().flatten())
            .map(|v| Self::decode(&v));
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

    fn as_spatial(&self) -> Option<&dyn SpatialCacheHandler> {
        Some(self)
    }
}

#[async_trait]
impl LazyCacheHandler for H3SpatialCache {
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
            "SELECT v AS {partition_key} FROM (
                SELECT unnest(partition_keys) AS v FROM {table} WHERE query_hash IN ({hashes})
                GROUP BY v HAVING count(DISTINCT query_hash) = {n}
             ) AS matched",
            n = existing.len(),
        );
        Ok((Some(sql), existing.len()))
    }

    async fn set_cache_lazy(&self, key: Fingerprint, select_sql: &str, partition_key: &str) -> Result<bool> {
        reject_unsafe_lazy_sql(select_sql)?;
        let table = self.cache_table(partition_key);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys)
             SELECT $1, array_agg(DISTINCT x) FROM ({select_sql}) AS src(x)
             ON CONFLICT (query_hash) DO UPDATE SET partition_keys = excluded.partition_keys"
        ))
        .bind(key.to_hex())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }
}

#[async_trait]
impl SpatialCacheHandler for H3SpatialCache {
    async fn get_spatial_filter(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
        buffer_distance: f64,
    ) -> Result<Option<SpatialFilter>> {
        let (cells, _count) = self.get_intersected(keys, partition_key).await?;
        let Some(cells) = cells else {
            return Ok(None);
        };
        let pad = buffer_distance + self.edge_length;
        let mut rings = Vec::with_capacity(cells.len());
        for id in cells.iter().filter_map(Identifier::as_i64) {
            let Ok(cell) = CellIndex::try_from(id as u64) else {
                continue;
            };
            let boundary = Self::cell_ring(cell);
            let (min_x, min_y, max_x, max_y) = envelope_of(&boundary);
            rings.push(wkb::dilated_rect_ring(min_x, min_y, max_x, max_y, pad));
        }
        if rings.is_empty() {
            return Ok(None);
        }
        Ok(Some(SpatialFilter {
            wkb: wkb::multipolygon(&rings),
            srid: self.srid,
        }))
    }

    async fn get_spatial_filter_lazy(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
        buffer_distance: f64,
    ) -> Result<Option<(String, i32)>> {
        // The lazy path still needs the cell set materialised in the
        // application to turn cell indices into a geometry — there is no
        // portable SQL H3-to-polygon function to defer to — so this
        // simply wraps the eager filter's bytes as a literal.
        match self.get_spatial_filter(keys, partition_key, buffer_distance).await? {
            None => Ok(None),
            Some(filter) => {
                let hex = filter.wkb.iter().map(|b| format!("{b:02x}")).collect::<String>();
                let sql = format!("SELECT ST_GeomFromWKB(decode('{hex}', 'hex'), {srid}) AS geom", srid = filter.srid);
                Ok(Some((sql, filter.srid)))
            }
        }
    }
}

fn envelope_of(points: &[(f64, f64)]) -> (f64, f64, f64, f64) {
    let mut min_x = f64::MAX;
    let mut min_y = f64::MAX;
    let mut max_x = f64::MIN;
    let mut max_y = f64::MIN;
    for (x, y) in points {
        min_x = min_x.min(*x);
        min_y = min_y.min(*y);
        max_x = max_x.max(*x);
        max_y = max_y.max(*y);
    }
    (min_x, min_y, max_x, max_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_of_single_point_is_degenerate() {
        let (min_x, min_y, max_x, max_y) = envelope_of(&[(1.0, 2.0)]);
        assert_eq!((min_x, min_y, max_x, max_y), (1.0, 2.0, 1.0, 2.0));
    }

    #[test]
    fn cell_ring_is_closed() {
        // Resolution-0 cell, arbitrary valid index used only to exercise
        // the boundary-to-ring conversion.
        let cell = CellIndex::try_from(0x8001fffffffffffu64).expect("valid base cell");
        let ring = H3SpatialCache::cell_ring(cell);
        assert_eq!(ring.first(), ring.last());
        assert!(ring.len() >= 4);
    }
}
