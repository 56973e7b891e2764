//! Backend selection and connection configuration, resolved from CLI
//! flags / environment variables / a `.env` file (spec §6 "Environment
//! variables", SPEC_FULL.md "Configuration": "backend selection, table
//! prefixes, queue provider, and variant-generation defaults are resolved
//! through `clap`-derived config structs with `env` attributes... not ad
//! hoc `std::env::var` calls").
//!
//! Precedence, highest first: CLI flag > environment variable > `.env`
//! file > default — `clap`'s `env` attribute gives us this for free once
//! [`load_dotenv`] has sourced the `.env` file into the process
//! environment before [`clap::Parser::parse`] runs.

use clap::Parser;

/// Loads a `.env` file from the current directory into the process
/// environment, if one exists. A missing file is not an error (spec §6,
/// "If there is a file named '.env' in the current working directory, it
/// is sourced before loading the configuration").
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => observability_deps::tracing::debug!(?path, "loaded .env file"),
        Err(dotenvy::Error::Io(_)) => {} // no .env file present; not an error
        Err(e) => observability_deps::tracing::warn!(error = %e, "failed to parse .env file"),
    }
}

/// Which cache backend realisation (spec §4.4) a command should talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
#[clap(rename_all = "kebab-case")]
pub enum CacheBackendKind {
    /// SQL-array value-set backend over co-located PostgreSQL.
    PgArray,
    /// External key-value value-set backend over Redis.
    Redis,
    /// Fixed-width bit-vector backend over co-located PostgreSQL.
    PgBitVector,
    /// Run-length (roaring) bitmap backend over co-located PostgreSQL.
    PgRoaring,
    /// H3 spatial tessellation backend over co-located PostgreSQL/PostGIS.
    H3,
    /// Bounding-box spatial backend over co-located PostgreSQL/PostGIS.
    Bbox,
}

/// Queue storage provider (spec §6 "`QUERY_QUEUE_PROVIDER`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
#[clap(rename_all = "kebab-case")]
pub enum QueueProvider {
    /// Durable PostgreSQL-backed queue (spec §6 "Queue layout").
    Postgres,
    /// In-memory queue; not durable, intended for local development only.
    Memory,
}

/// Connection and backend-selection flags shared by every subcommand
/// that talks to a cache, queue, or target database.
#[derive(Debug, Clone, Parser)]
pub struct ConnectionConfig {
    /// Connection string for every PostgreSQL-family backend, the
    /// PostgreSQL queue provider, and fragment execution against the
    /// target database.
    #[clap(long, env = "DATABASE_URL", default_value = "postgres://localhost/partitioncache")]
    pub database_url: String,

    /// Connection string for the Redis value-set backend.
    #[clap(long, env = "REDIS_URL", default_value = "redis://localhost")]
    pub redis_url: String,

    /// Which cache backend realisation to use (spec §6 `CACHE_BACKEND`).
    #[clap(long, arg_enum, env = "CACHE_BACKEND", default_value = "pg-array")]
    pub cache_backend: CacheBackendKind,

    /// Table prefix shared by every co-located backend unless overridden
    /// below.
    #[clap(long, env = "PARTITIONCACHE_TABLE_PREFIX", default_value = "partitioncache")]
    pub table_prefix: String,

    /// Table prefix override for the SQL-array backend (spec §6
    /// `PG_ARRAY_CACHE_TABLE_PREFIX`).
    #[clap(long, env = "PG_ARRAY_CACHE_TABLE_PREFIX")]
    pub pg_array_table_prefix: Option<String>,

    /// Table prefix override for the bit-vector backend (spec §6
    /// `PG_BIT_CACHE_TABLE_PREFIX`).
    #[clap(long, env = "PG_BIT_CACHE_TABLE_PREFIX")]
    pub pg_bit_table_prefix: Option<String>,

    /// Table prefix override for the roaring-bitmap backend.
    #[clap(long, env = "PG_ROARING_CACHE_TABLE_PREFIX")]
    pub pg_roaring_table_prefix: Option<String>,

    /// Table prefix override for the H3 spatial backend.
    #[clap(long, env = "PG_H3_CACHE_TABLE_PREFIX")]
    pub pg_h3_table_prefix: Option<String>,

    /// Table prefix override for the bounding-box spatial backend.
    #[clap(long, env = "PG_BBOX_CACHE_TABLE_PREFIX")]
    pub pg_bbox_table_prefix: Option<String>,

    /// Maximum width the bit-vector backend may grow a partition key's
    /// allocated domain to. Unbounded when unset.
    #[clap(long, env = "PARTITIONCACHE_BITVECTOR_MAX_BITSIZE")]
    pub bitvector_max_bitsize: Option<u32>,

    /// Spatial reference system identifier used by the spatial backends.
    #[clap(long, env = "PARTITIONCACHE_SPATIAL_SRID", default_value = "4326")]
    pub spatial_srid: i32,

    /// H3 cell edge length (metres) used by the H3 backend's buffer
    /// derivation.
    #[clap(long, env = "PARTITIONCACHE_H3_EDGE_LENGTH", default_value = "500.0")]
    pub h3_edge_length: f64,

    /// Bounding-box backend cell size, used the same way as the H3
    /// edge length for buffer derivation.
    #[clap(long, env = "PARTITIONCACHE_BBOX_CELL_SIZE", default_value = "0.01")]
    pub bbox_cell_size: f64,

    /// Queue storage provider (spec §6 `QUERY_QUEUE_PROVIDER`).
    #[clap(long, arg_enum, env = "QUERY_QUEUE_PROVIDER", default_value = "postgres")]
    pub queue_provider: QueueProvider,

    /// Table prefix for the two durable queue tables.
    #[clap(long, env = "QUERY_QUEUE_TABLE_PREFIX", default_value = "partitioncache_queue")]
    pub queue_table_prefix: String,
}

impl ConnectionConfig {
    /// The effective table prefix for the currently selected
    /// [`CacheBackendKind`]: its specific override if set, else
    /// [`Self::table_prefix`].
    pub fn effective_table_prefix(&self) -> &str {
        let specific = match self.cache_backend {
            CacheBackendKind::PgArray => &self.pg_array_table_prefix,
            CacheBackendKind::Redis => &None,
            CacheBackendKind::PgBitVector => &self.pg_bit_table_prefix,
            CacheBackendKind::PgRoaring => &self.pg_roaring_table_prefix,
            CacheBackendKind::H3 => &self.pg_h3_table_prefix,
            CacheBackendKind::Bbox => &self.pg_bbox_table_prefix,
        };
        specific.as_deref().unwrap_or(&self.table_prefix)
    }
}

/// Partition-key selection shared by most cache-management subcommands.
#[derive(Debug, Clone, Parser)]
pub struct PartitionArg {
    /// The partition key to operate on (spec §3 "Partition key").
    #[clap(long)]
    pub partition_key: String,

    /// The partition key's datatype (`integer`|`float`|`text`|
    /// `timestamp`|`geometry`), required the first time it's registered
    /// with a backend. Parsed by the caller rather than by `clap`
    /// directly, so an invalid value surfaces as a single-line
    /// configuration error (spec §6 exit code 2) instead of `clap`'s
    /// usage message.
    #[clap(long)]
    pub partition_datatype: Option<String>,
}
