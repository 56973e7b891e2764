//! Crate-wide error kinds (spec §7 "Error Handling Design").
//!
//! These are behavioural, not type-named, in the source; here they become
//! one `snafu` enum shared by every internal crate so the apply-cache
//! rewriter, pipeline, and maintenance code can match on a single `Error`
//! type instead of each crate minting its own.

use crate::datatype::PartitionDatatype;
use snafu::Snafu;

/// Errors surfaced across the cache-handler / query-processor boundary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The canonicaliser could not parse the supplied SQL.
    #[snafu(display("failed to parse query as SQL: {source}"))]
    InvalidQuery {
        /// Underlying parser error text.
        source: sqlparser::parser::ParserError,
    },

    /// The backend does not support the requested datatype.
    #[snafu(display("backend does not support datatype {datatype}"))]
    UnsupportedDatatype {
        /// The datatype that was rejected.
        datatype: PartitionDatatype,
    },

    /// The partition key is already registered with a different datatype.
    #[snafu(display(
        "partition key '{partition_key}' is already registered as {existing}, cannot use {requested}"
    ))]
    DatatypeConflict {
        /// Name of the partition key.
        partition_key: String,
        /// The datatype it is currently registered with.
        existing: PartitionDatatype,
        /// The datatype the caller tried to register it with.
        requested: PartitionDatatype,
    },

    /// An identifier exceeds the bit-vector's configured bitsize and the
    /// handler was not able to (or configured to) grow it.
    #[snafu(display(
        "identifier {value} exceeds bitsize {bitsize} for partition key '{partition_key}'"
    ))]
    DomainOverflow {
        /// Partition key whose bit-vector was too small.
        partition_key: String,
        /// The offending identifier value.
        value: i64,
        /// The bitsize in effect when the overflow was detected.
        bitsize: u32,
    },

    /// A connection was lost, a transaction aborted, or a lock timed out.
    /// Callers should retry (see `partitioncache_backoff`).
    #[snafu(display("transient backend error: {message}"))]
    BackendTransient {
        /// Description of the transient condition.
        message: String,
    },

    /// The table/namespace backing a partition does not exist because it
    /// was never registered. Treated as "absent", not an error condition
    /// that should propagate.
    #[snafu(display("partition '{partition_key}' has not been registered with this backend"))]
    BackendMissing {
        /// The partition key that has no backing storage yet.
        partition_key: String,
    },

    /// A fragment hit a row-count limit or statement timeout during
    /// population. The cache entry is stored as NULL with the matching
    /// status.
    #[snafu(display("fragment execution hit a resource limit: {message}"))]
    ResourceLimit {
        /// Human-readable description (row count exceeded / statement
        /// timeout).
        message: String,
    },

    /// A lazy insertion path (`set_cache_lazy`) was given SQL containing a
    /// DDL or DELETE statement and refused to execute it.
    #[snafu(display("refusing to execute unsafe lazy query: {reason}"))]
    UnsafeLazyQuery {
        /// Why the query was rejected.
        reason: String,
    },
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
