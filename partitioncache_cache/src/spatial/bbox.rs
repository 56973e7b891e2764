//! Bounding-box spatial backend (spec §4.4 "Spatial bounding-box").
//!
//! Each row's identifier is its geometry's axis-aligned envelope, stored
//! as a WKB `MULTIPOLYGON` of one rectangle per contributing row in a
//! PostGIS `geometry` column. The "intersection" of a set of entries is,
//! per spec, their *union* after each envelope is independently dilated
//! by `buffer_distance + cell_size` — dilation is what lets two
//! fragments whose raw envelopes don't touch, but whose `ST_DWithin`
//! radius would connect them, still compose into one connected filter.

use crate::handler::{reject_unsafe_lazy_sql, CacheEntryMeta, CacheHandler, LazyCacheHandler, SpatialCacheHandler, SpatialFilter};
use crate::spatial::wkb;
use async_trait::async_trait;
use observability_deps::tracing::debug;
use partitioncache_time::{Time, TimeProviderRef};
use partitioncache_types::error::UnsupportedDatatypeSnafu;
use partitioncache_types::{Error, Fingerprint, Identifier, IdentifierSet, PartitionDatatype, QueryStatus, Result};
use snafu::ensure;
use sqlx::{PgPool, Row};
use std::any::Any;
use std::collections::BTreeSet;

const SUPPORTED: &[PartitionDatatype] = &[PartitionDatatype::Geometry];

/// Bounding-box spatial cache over a co-located PostGIS-enabled
/// PostgreSQL database.
#[derive(Debug)]
pub struct BboxSpatialCache {
    pool: PgPool,
    table_prefix: String,
    time_provider: TimeProviderRef,
    srid: i32,
    /// Added to `buffer_distance` at dilation time; the width of the
    /// tessellation cell the envelopes were derived from, if any.
    cell_size: f64,
}

impl BboxSpatialCache {
    /// Construct a handler over an existing PostGIS-enabled pool.
    pub fn new(
        pool: PgPool,
        table_prefix: impl Into<String>,
        time_provider: TimeProviderRef,
        srid: i32,
        cell_size: f64,
    ) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.into(),
            time_provider,
            srid,
            cell_size,
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
        sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        let metadata = self.metadata_table();
        let queries = self.queries_table();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {metadata} (
                partition_key TEXT PRIMARY KEY,
                datatype TEXT NOT NULL CHECK (datatype = 'geometry'),
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
                partition_keys geometry(MultiPolygon, {srid}),
                partition_keys_count INTEGER GENERATED ALWAYS AS (
                    CASE WHEN partition_keys IS NULL THEN NULL ELSE ST_NumGeometries(partition_keys) END
                ) STORED
            )",
            srid = self.srid,
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    fn identifiers_to_multipolygon_wkb(identifiers: &IdentifierSet) -> Vec<u8> {
        let rings: Vec<Vec<(f64, f64)>> = identifiers
            .iter()
            .filter_map(Identifier::as_wkb)
            .filter_map(ring_from_polygon_wkb)
            .collect();
        wkb::multipolygon(&rings)
    }
}

/// Extracts the single exterior ring from a WKB polygon written by
/// [`wkb::polygon`] (always exactly one ring, no holes).
fn ring_from_polygon_wkb(bytes: &[u8]) -> Option<Vec<(f64, f64)>> {
    if bytes.len() < 13 {
        return None;
    }
    let num_points = u32::from_le_bytes(bytes[9..13].try_into().ok()?) as usize;
    let mut ring = Vec::with_capacity(num_points);
    let mut offset = 13;
    for _ in 0..num_points {
        let x = f64::from_le_bytes(bytes.get(offset..offset + 8)?.try_into().ok()?);
        let y = f64::from_le_bytes(bytes.get(offset + 8..offset + 16)?.try_into().ok()?);
        ring.push((x, y));
        offset += 16;
    }
    Some(ring)
}

fn transient(e: sqlx::Error) -> Error {
    Error::BackendTransient {
        message: e.to_string(),
    }
}

#[async_trait]
impl CacheHandler for BboxSpatialCache {
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
            "INSERT INTO {metadata} (partition_key, datatype) VALUES ($1, 'geometry')
             ON CONFLICT (partition_key) DO NOTHING"
        ))
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        debug!(partition_key, "registered bbox spatial partition key");
        Ok(())
    }

    fn supported_datatypes(&self) -> &'static [PartitionDatatype] {
        SUPPORTED
    }

    async fn set_cache(&self, key: Fingerprint, identifiers: &IdentifierSet, partition_key: &str) -> Result<bool> {
        let table = self.cache_table(partition_key);
        let wkb_bytes = Self::identifiers_to_multipolygon_wkb(identifiers);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys) VALUES ($1, ST_SetSRID(ST_GeomFromWKB($2), {srid}))
             ON CONFLICT (query_hash) DO UPDATE SET partition_keys = excluded.partition_keys",
            srid = self.srid,
        ))
        .bind(key.to_hex())
        .bind(wkb_bytes)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }

    async fn get(&self, key: Fingerprint, partition_key: &str) -> Result<Option<IdentifierSet>> {
        let table = self.cache_table(partition_key);
        let rows = sqlx::query(&format!(
            "SELECT ST_XMin(g) AS min_x, ST_YMin(g) AS min_y, ST_XMax(g) AS max_x, ST_YMax(g) AS max_y
             FROM (SELECT (ST_Dump(partition_keys)).geom AS g FROM {table} WHERE query_hash = $1) AS sub"
        ))
        .bind(key.to_hex())
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut out = IdentifierSet::new();
        for row in rows {
            let (min_x, min_y, max_x, max_y): (f64, f64, f64, f64) = (
                row.try_get("min_x").map_err(transient)?,
                row.try_get("min_y").map_err(transient)?,
                row.try_get("max_x").map_err(transient)?,
                row.try_get("max_y").map_err(transient)?,
            );
            let ring = wkb::dilated_rect_ring(min_x, min_y, max_x, max_y, 0.0);
            out.insert(Identifier::Geometry(wkb::polygon(&ring)));
        }
        Ok(Some(out))
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
        let rows = sqlx::query(&format!(
            "SELECT ST_XMin(g) AS min_x, ST_YMin(g) AS min_y, ST_XMax(g) AS max_x, ST_YMax(g) AS max_y
             FROM (SELECT (ST_Dump(partition_keys)).geom AS g FROM {table} WHERE query_hash IN ({hashes})) AS sub"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;
        let mut out = IdentifierSet::new();
        for row in rows {
            let (min_x, min_y, max_x, max_y): (f64, f64, f64, f64) = (
                row.try_get("min_x").map_err(transient)?,
                row.try_get("min_y").map_err(transient)?,
                row.try_get("max_x").map_err(transient)?,
                row.try_get("max_y").map_err(transient)?,
            );
            let ring = wkb::dilated_rect_ring(min_x, min_y, max_x, max_y, 0.0);
            out.insert(Identifier::Geometry(wkb::polygon(&ring)));
        }
        Ok((Some(out), existing.len()))
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
            .map(|pk| (pk, PartitionDatatype::Geometry))
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
impl LazyCacheHandler for BboxSpatialCache {
    async fn get_intersected_lazy(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
    ) -> Result<(Option<String>, usize)> {
        let (filter, count) = self.get_spatial_filter_lazy(keys, partition_key, 0.0).await?;
        match filter {
            None => Ok((None, 0)),
            Some((sql, _srid)) => Ok((Some(sql), count)),
        }
    }

    async fn set_cache_lazy(&self, key: Fingerprint, select_sql: &str, partition_key: &str) -> Result<bool> {
        reject_unsafe_lazy_sql(select_sql)?;
        let table = self.cache_table(partition_key);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, partition_keys)
             SELECT $1, ST_Collect(ST_SetSRID(g, {srid})) FROM ({select_sql}) AS src(g)
             ON CONFLICT (query_hash) DO UPDATE SET partition_keys = excluded.partition_keys",
            srid = self.srid,
        ))
        .bind(key.to_hex())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(true)
    }
}

#[async_trait]
impl SpatialCacheHandler for BboxSpatialCache {
    async fn get_spatial_filter(
        &self,
        keys: &[Fingerprint],
        partition_key: &str,
        buffer_distance: f64,
    ) -> Result<Option<SpatialFilter>> {
        let existing = self.filter_existing_keys(keys, partition_key, false).await?;
        if existing.is_empty() {
            return Ok(None);
        }
        let table = self.cache_table(partition_key);
        let hashes = existing.iter().map(|k| format!("'{}'", k.to_hex())).collect::<Vec<_>>().join(", ");
        let rows = sqlx::query(&format!(
            "SELECT ST_XMin(g) AS min_x, ST_YMin(g) AS min_y, ST_XMax(g) AS max_x, ST_YMax(g) AS max_y
             FROM (SELECT (ST_Dump(partition_keys)).geom AS g FROM {table} WHERE query_hash IN ({hashes})) AS sub"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let pad = buffer_distance + self.cell_size;
        let rings: Vec<Vec<(f64, f64)>> = rows
            .into_iter()
            .map(|row| {
                let min_x: f64 = row.try_get("min_x").unwrap_or(0.0);
                let min_y: f64 = row.try_get("min_y").unwrap_or(0.0);
                let max_x: f64 = row.try_get("max_x").unwrap_or(0.0);
                let max_y: f64 = row.try_get("max_y").unwrap_or(0.0);
                wkb::dilated_rect_ring(min_x, min_y, max_x, max_y, pad)
            })
            .collect();
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
        let existing = self.filter_existing_keys(keys, partition_key, false).await?;
        if existing.is_empty() {
            return Ok(None);
        }
        let table = self.cache_table(partition_key);
        let hashes = existing.iter().map(|k| format!("'{}'", k.to_hex())).collect::<Vec<_>>().join(", ");
        let pad = buffer_distance + self.cell_size;
        let sql = format!(
            "SELECT ST_Union(ST_Expand(g, {pad})) AS geom
             FROM (SELECT (ST_Dump(partition_keys)).geom AS g FROM {table} WHERE query_hash IN ({hashes})) AS sub"
        );
        Ok(Some((sql, self.srid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_round_trips_through_polygon_wkb() {
        let ring = wkb::dilated_rect_ring(0.0, 0.0, 2.0, 3.0, 0.0);
        let bytes = wkb::polygon(&ring);
        let decoded = ring_from_polygon_wkb(&bytes).unwrap();
        assert_eq!(decoded, ring);
    }

    #[test]
    fn identifiers_to_multipolygon_counts_rings() {
        let mut set = IdentifierSet::new();
        set.insert(Identifier::Geometry(wkb::polygon(&wkb::dilated_rect_ring(0.0, 0.0, 1.0, 1.0, 0.0))));
        set.insert(Identifier::Geometry(wkb::polygon(&wkb::dilated_rect_ring(5.0, 5.0, 6.0, 6.0, 0.0))));
        let bytes = BboxSpatialCache::identifiers_to_multipolygon_wkb(&set);
        assert_eq!(u32::from_le_bytes(bytes[5..9].try_into().unwrap()), 2);
    }
}
