//! PartitionCache: accelerates repeated, analytically expensive SQL
//! queries whose result sets can be pre-reduced to the distinct set of a
//! single partition key.
//!
//! This crate re-exports the workspace's component crates as one
//! coherent public API, the way a consumer would `use partitioncache::...`
//! rather than depending on each `partitioncache_*` crate individually:
//!
//! - [`query`] — canonicalisation and fragment generation.
//! - [`cache`] — the cache handler trait family and its backend
//!   realisations.
//! - [`queue`] — the durable original/fragment queue abstraction.
//! - [`rewrite`] — the apply-cache rewriter.
//! - [`pipeline`] — the asynchronous population pipeline and the
//!   in-database processor control plane.
//! - [`maintenance`] — pruning, eviction, and partition deletion.
//! - [`types`] — the shared data model and error type.
//! - [`time`] — the injectable time provider used for age-based logic.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, missing_docs)]

pub use partitioncache_cache as cache;
pub use partitioncache_maintenance as maintenance;
pub use partitioncache_pipeline as pipeline;
pub use partitioncache_query as query;
pub use partitioncache_queue as queue;
pub use partitioncache_rewrite as rewrite;
pub use partitioncache_time as time;
pub use partitioncache_types as types;

pub use partitioncache_cache::{CacheHandler, LazyCacheHandler, SpatialCacheHandler};
pub use partitioncache_query::{canonicalize, generate_fragments, FragmentOptions};
pub use partitioncache_queue::QueueHandler;
pub use partitioncache_rewrite::{apply_cache, RewriteOptions, RewriteStats, SpliceMethod};
pub use partitioncache_types::{
    Error, Fingerprint, IdentifierSet, PartitionDatatype, QueryStatus, Result,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_reexport_matches_source_crate() {
        let a = Fingerprint::of("select 1");
        let b = partitioncache_types::Fingerprint::of("select 1");
        assert_eq!(a, b);
    }
}
