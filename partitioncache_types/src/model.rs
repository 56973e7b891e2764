//! Cache entries, query metadata, and partition registry records (spec §3).

use crate::datatype::{IdentifierSet, PartitionDatatype};
use crate::fingerprint::Fingerprint;
use partitioncache_time::Time;

/// Status of a query-metadata entry, recording how the fragment's last
/// execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QueryStatus {
    /// The fragment executed successfully and its result is usable.
    Ok,
    /// The fragment's statement timed out.
    Timeout,
    /// The fragment hit a row-count (or other resource) limit.
    Failed,
}

impl QueryStatus {
    /// Stable lowercase name, matching the `status` CHECK constraint
    /// vocabulary used by the co-located storage layout.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for QueryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "timeout" => Ok(Self::Timeout),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown query status '{other}'")),
        }
    }
}

/// Logical cache entry: `(partition_key, fingerprint, identifier_set | NULL,
/// created_at)`.
///
/// `identifiers: None` is the NULL sentinel meaning the fragment executed
/// but its result is unusable (resource limit or timeout).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The partition key namespace this entry belongs to.
    pub partition_key: String,
    /// The fragment fingerprint this entry is keyed by.
    pub fingerprint: Fingerprint,
    /// The identifier set, or `None` for the NULL sentinel.
    pub identifiers: Option<IdentifierSet>,
    /// When this entry was created or last overwritten.
    pub created_at: Time,
}

/// Logical query-metadata entry: `(partition_key, fingerprint, fragment_sql,
/// status, last_seen)`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMetadataEntry {
    /// The partition key namespace this entry belongs to.
    pub partition_key: String,
    /// The fragment fingerprint this entry is keyed by.
    pub fingerprint: Fingerprint,
    /// The fragment SQL text, stored as metadata alongside the cache entry.
    pub fragment_sql: String,
    /// The outcome of the fragment's last execution.
    pub status: QueryStatus,
    /// Last time this entry was (re-)confirmed current; drives
    /// age-based pruning.
    pub last_seen: Time,
}

/// Registry record mapping a partition key to its fixed datatype and, for
/// the bit-vector backend, its allocated bitsize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionKeyMeta {
    /// The datatype this partition key was registered with.
    pub datatype: PartitionDatatype,
    /// Allocated bit-vector width, if this partition key uses the
    /// bit-vector backend. Bitsize can only grow; see
    /// [`crate::error::Error::DomainOverflow`].
    pub bitsize: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_status_round_trips() {
        for s in [QueryStatus::Ok, QueryStatus::Timeout, QueryStatus::Failed] {
            let parsed: QueryStatus = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
