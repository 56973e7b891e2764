//! Options accepted by [`crate::rewriter::apply_cache`] (spec §4.5).

use crate::splice::SpliceMethod;
use partitioncache_query::FragmentOptions;

/// Options controlling one `apply_cache` call.
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// How the cache restriction is embedded into the rewritten query.
    pub splice: SpliceMethod,
    /// Fragment-generation options. These must match whatever options
    /// populated the cache — mismatched options produce different
    /// fingerprints and every lookup misses (spec §4.5 step 1, "the same
    /// generator the population pipeline uses").
    pub fragment: FragmentOptions,
    /// The outer query's geometry column. Set alongside
    /// `buffer_distance` to take the spatial splice path (spec §4.5 step
    /// 4 "Spatial path").
    pub geometry_column: Option<String>,
    /// Buffer distance passed to `ST_DWithin` when splicing a spatial
    /// filter.
    pub buffer_distance: Option<f64>,
}

impl RewriteOptions {
    /// Whether `geometry_column`/`buffer_distance` are both present,
    /// i.e. whether the spatial splice path applies.
    pub fn wants_spatial(&self) -> bool {
        self.geometry_column.is_some() && self.buffer_distance.is_some()
    }
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            splice: SpliceMethod::InSubquery,
            fragment: FragmentOptions::default(),
            geometry_column: None,
            buffer_distance: None,
        }
    }
}
