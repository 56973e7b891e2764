//! Constructs concrete cache/queue handlers and a target-database
//! fragment executor from [`ConnectionConfig`], and implements
//! [`partitioncache_pipeline::DbExecutor`] over a plain `sqlx` PostgreSQL
//! pool — the minimal "external collaborator" the core only needs a
//! SQL-execution interface from (spec §1).

use crate::config::{CacheBackendKind, ConnectionConfig, QueueProvider};
use async_trait::async_trait;
use partitioncache_cache::{
    bitvector::PgBitVectorCache,
    roaring::PgRoaringBitmapCache,
    spatial::{BboxSpatialCache, H3SpatialCache},
    value_set::{PgArrayCache, RedisCache},
    CacheHandler,
};
use partitioncache_pipeline::{DbExecutor, ExecutionOptions, FragmentOutcome};
use partitioncache_queue::{InMemoryQueueHandler, PgQueueHandler, QueueHandler};
use partitioncache_time::{SystemProvider, TimeProviderRef};
use partitioncache_types::{Error, Identifier, IdentifierSet, PartitionDatatype, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;

/// Opens a PostgreSQL pool against `config.database_url`.
pub async fn connect_postgres(config: &ConnectionConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .map_err(|e| Error::BackendTransient {
            message: format!("failed to connect to {}: {e}", config.database_url),
        })
}

/// Opens a Redis connection pool against `config.redis_url`.
pub async fn connect_redis(config: &ConnectionConfig) -> Result<deadpool_redis::Pool> {
    let cfg = deadpool_redis::Config::from_url(&config.redis_url);
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| Error::BackendTransient {
            message: format!("failed to build redis pool: {e}"),
        })
}

/// Builds the cache handler selected by `config.cache_backend`.
pub async fn build_cache_handler(config: &ConnectionConfig) -> Result<Arc<dyn CacheHandler>> {
    let time_provider: TimeProviderRef = Arc::new(SystemProvider::new());
    let table_prefix = config.effective_table_prefix().to_string();

    let handler: Arc<dyn CacheHandler> = match config.cache_backend {
        CacheBackendKind::PgArray => {
            let pool = connect_postgres(config).await?;
            Arc::new(PgArrayCache::new(pool, table_prefix, time_provider))
        }
        CacheBackendKind::Redis => {
            let pool = connect_redis(config).await?;
            Arc::new(RedisCache::new(pool, time_provider))
        }
        CacheBackendKind::PgBitVector => {
            let pool = connect_postgres(config).await?;
            Arc::new(PgBitVectorCache::new(pool, table_prefix, time_provider, config.bitvector_max_bitsize))
        }
        CacheBackendKind::PgRoaring => {
            let pool = connect_postgres(config).await?;
            Arc::new(PgRoaringBitmapCache::new(pool, table_prefix, time_provider))
        }
        CacheBackendKind::H3 => {
            let pool = connect_postgres(config).await?;
            Arc::new(H3SpatialCache::new(pool, table_prefix, time_provider, config.spatial_srid, config.h3_edge_length))
        }
        CacheBackendKind::Bbox => {
            let pool = connect_postgres(config).await?;
            Arc::new(BboxSpatialCache::new(pool, table_prefix, time_provider, config.spatial_srid, config.bbox_cell_size))
        }
    };
    Ok(handler)
}

/// Builds the queue handler selected by `config.queue_provider`.
pub async fn build_queue_handler(config: &ConnectionConfig) -> Result<Arc<dyn QueueHandler>> {
    match config.queue_provider {
        QueueProvider::Postgres => {
            let pool = connect_postgres(config).await?;
            let handler = PgQueueHandler::new(pool, config.queue_table_prefix.clone()).await?;
            Ok(Arc::new(handler))
        }
        QueueProvider::Memory => Ok(Arc::new(InMemoryQueueHandler::new())),
    }
}

/// Executes fragments against a plain PostgreSQL pool: runs the
/// fragment's single-column `SELECT`, decoding each row as the
/// requested [`PartitionDatatype`], honouring `options.row_limit` and
/// `options.statement_timeout` (spec §4.6 "Execute the fragment SQL on
/// the target database with a configured statement timeout and optional
/// row-count limit").
#[derive(Debug)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    /// Wraps an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DbExecutor for PgExecutor {
    async fn execute_fragment(
        &self,
        fragment_sql: &str,
        datatype: PartitionDatatype,
        options: &ExecutionOptions,
    ) -> Result<FragmentOutcome> {
        match tokio::time::timeout(options.statement_timeout, self.fetch(fragment_sql, datatype, options.row_limit)).await {
            Ok(result) => result,
            Err(_) => Ok(FragmentOutcome::StatementTimeout),
        }
    }
}

impl PgExecutor {
    async fn fetch(&self, fragment_sql: &str, datatype: PartitionDatatype, row_limit: Option<usize>) -> Result<FragmentOutcome> {
        let rows = sqlx::query(fragment_sql).fetch_all(&self.pool).await.map_err(|e| Error::BackendTransient {
            message: e.to_string(),
        })?;

        if let Some(limit) = row_limit {
            if rows.len() > limit {
                return Ok(FragmentOutcome::RowLimitExceeded);
            }
        }

        let mut identifiers = IdentifierSet::new();
        for row in &rows {
            let id = decode_identifier(row, datatype)?;
            identifiers.insert(id);
        }
        Ok(FragmentOutcome::Success(identifiers))
    }
}

fn decode_identifier(row: &sqlx::postgres::PgRow, datatype: PartitionDatatype) -> Result<Identifier> {
    let transient = |e: sqlx::Error| Error::BackendTransient { message: e.to_string() };
    match datatype {
        PartitionDatatype::Integer => Ok(Identifier::Integer(row.try_get::<i64, _>(0).map_err(transient)?)),
        PartitionDatatype::Float => Ok(Identifier::Float(row.try_get::<f64, _>(0).map_err(transient)?)),
        PartitionDatatype::Text => Ok(Identifier::Text(row.try_get::<String, _>(0).map_err(transient)?)),
        PartitionDatatype::Timestamp => {
            let ts: chrono::DateTime<chrono::Utc> = row.try_get(0).map_err(transient)?;
            Ok(Identifier::Timestamp(ts.timestamp_millis()))
        }
        PartitionDatatype::Geometry => Ok(Identifier::Geometry(row.try_get::<Vec<u8>, _>(0).map_err(transient)?)),
    }
}

/// Parses `s` as a [`PartitionDatatype`]. Kept separate from `clap`'s own
/// parsing so a malformed value can be reported on the CLI's exit-code-2
/// path instead of `clap`'s usage-error exit path (see
/// [`crate::config::PartitionArg::partition_datatype`]).
pub fn parse_partition_datatype(s: &str) -> std::result::Result<PartitionDatatype, String> {
    s.parse()
}
