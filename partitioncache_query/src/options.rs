//! Options accepted by the canonicaliser and fragment generator (spec
//! §4.1, §4.2). The same options struct is shared by the population
//! pipeline and the apply-cache rewriter — this is what spec §4.5 step 1
//! calls out as "critical so fingerprints match".

use std::collections::BTreeMap;

/// How numeric ranges are bucketed during canonicalisation (spec §4.1
/// step 4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSteps {
    /// The bucket width. A value `<= 0.0` disables bucketing entirely.
    pub step: f64,
    /// When `true`, bucketing only applies inside the arguments of
    /// recognised distance-style functions (`DIST`, `ST_DISTANCE`, and a
    /// manually recognised Euclidean-distance expression pattern), not to
    /// every numeric range predicate in the query (spec §4.1 step 5).
    pub distance_functions_only: bool,
}

impl Default for BucketSteps {
    fn default() -> Self {
        Self {
            step: 1.0,
            distance_functions_only: false,
        }
    }
}

impl BucketSteps {
    /// Bucketing is a no-op for non-positive steps.
    pub fn enabled(&self) -> bool {
        self.step > 0.0
    }

    /// Round `lo` down and `hi` up to the nearest multiple of `step`.
    /// Negative bounds are left untouched (spec §4.1 step 4).
    pub fn bucket(&self, lo: f64, hi: f64) -> (f64, f64) {
        if !self.enabled() {
            return (lo, hi);
        }
        let bucketed_lo = if lo < 0.0 {
            lo
        } else {
            (lo / self.step).floor() * self.step
        };
        let bucketed_hi = if hi < 0.0 {
            hi
        } else {
            (hi / self.step).ceil() * self.step
        };
        (bucketed_lo, bucketed_hi)
    }
}

/// Options controlling canonicalisation (spec §4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalizeOptions {
    /// Numeric range bucketing configuration.
    pub bucket_steps: BucketSteps,
}

impl Default for CanonicalizeOptions {
    fn default() -> Self {
        Self {
            bucket_steps: BucketSteps::default(),
        }
    }
}

/// How a star-join table is identified (spec §4.2 "Star-join
/// optimisation"). Precedence when more than one rule could apply:
/// explicit name/alias > naming convention > auto-detect.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StarJoinDetection {
    /// An explicitly named table or alias to treat as the star-join table.
    pub explicit: Option<String>,
    /// Naming-convention prefix (default `p0_`) identifying a star-join
    /// table by name.
    pub naming_prefix: Option<String>,
    /// Whether automatic detection (a table whose only predicates are
    /// partition-key equi-joins) is enabled.
    pub auto_detect: bool,
}

impl StarJoinDetection {
    /// The default detection policy: naming convention `p0_`, plus
    /// automatic detection.
    pub fn default_policy() -> Self {
        Self {
            explicit: None,
            naming_prefix: Some("p0_".to_string()),
            auto_detect: true,
        }
    }
}

/// Per-table constraint transforms applied when generating fragment
/// variants (spec §4.2 "Constraint transforms").
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstraintTransforms {
    /// For each recognised table, an additional predicate AND-joined into
    /// every fragment that includes that table.
    pub add_constraints: BTreeMap<String, String>,
    /// Attribute names stripped from every fragment unconditionally.
    pub remove_constraints_all: Vec<String>,
    /// Attribute names stripped in an additional copy of every fragment
    /// (the original, un-stripped fragment is also kept).
    pub remove_constraints_add: Vec<String>,
}

/// Options controlling fragment generation (spec §4.2).
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentOptions {
    /// Smallest connected join-graph subset size to enumerate.
    pub min_component_size: usize,
    /// Largest connected join-graph subset size to enumerate. `None`
    /// means unbounded (every connected subset up to the full graph).
    pub max_component_size: Option<usize>,
    /// Whether the partition-key equi-join itself participates as a join
    /// graph edge during enumeration (if `false`, only explicit
    /// multi-table predicates connect tables).
    pub follow_partition_key_joins: bool,
    /// How to identify the star-join table, if any.
    pub star_join: StarJoinDetection,
    /// Per-table/attribute constraint transforms.
    pub constraints: ConstraintTransforms,
    /// Canonicalisation options re-applied when synthesising fragments
    /// from modified predicates.
    pub canonicalize: CanonicalizeOptions,
}

impl Default for FragmentOptions {
    fn default() -> Self {
        Self {
            min_component_size: 1,
            max_component_size: None,
            follow_partition_key_joins: true,
            star_join: StarJoinDetection::default_policy(),
            constraints: ConstraintTransforms::default(),
            canonicalize: CanonicalizeOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_step_rounds_outward() {
        let bs = BucketSteps {
            step: 1.0,
            distance_functions_only: false,
        };
        assert_eq!(bs.bucket(1.6, 3.6), (1.0, 4.0));
    }

    #[test]
    fn bucket_step_half() {
        let bs = BucketSteps {
            step: 0.5,
            distance_functions_only: false,
        };
        assert_eq!(bs.bucket(1.6, 3.6), (1.5, 4.0));
    }

    #[test]
    fn non_positive_step_disables_bucketing() {
        let bs = BucketSteps {
            step: 0.0,
            distance_functions_only: false,
        };
        assert!(!bs.enabled());
        assert_eq!(bs.bucket(1.6, 3.6), (1.6, 3.6));
    }

    #[test]
    fn negative_bounds_untouched() {
        let bs = BucketSteps {
            step: 1.0,
            distance_functions_only: false,
        };
        assert_eq!(bs.bucket(-1.5, 3.6), (-1.5, 4.0));
    }
}
