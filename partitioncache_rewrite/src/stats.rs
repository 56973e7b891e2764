//! The stats record returned alongside a rewritten query (spec §4.5
//! "Outputs: the rewritten SQL string and a stats record").

/// Outcome of one [`crate::rewriter::apply_cache`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RewriteStats {
    /// Number of fragment variants the generator produced for the input
    /// query.
    pub generated_variants: usize,
    /// Number of those fragments present in the cache.
    pub cache_hits: usize,
    /// Whether the query was actually rewritten. `false` whenever
    /// `cache_hits == 0` (spec §4.5 step 3).
    pub enhanced: bool,
    /// Whether a star-join reattachment detected on the input query was
    /// undone in the rewritten query (spec §4.5 step 5).
    pub p0_rewritten: bool,
}
