//! Partition-key datatypes and the identifier values that populate an
//! identifier set (spec §3 "Partition key").

use ordered_float::OrderedFloat;
use std::collections::BTreeSet;
use std::fmt;

/// The fixed datatype of a partition key's distinct-value domain.
///
/// Once a partition key is registered with a datatype it must not change;
/// re-registering with a conflicting datatype is a [`crate::error::Error::DatatypeConflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum PartitionDatatype {
    /// 64-bit signed integer identifiers. Required by the bit-vector and
    /// roaring-bitmap backends.
    Integer,
    /// Floating point identifiers.
    Float,
    /// Text identifiers.
    Text,
    /// Timestamp identifiers.
    Timestamp,
    /// Geometry identifiers (tessellation cell ids or envelopes), used only
    /// by the spatial backends.
    Geometry,
}

impl PartitionDatatype {
    /// Stable lowercase name, matching the CHECK constraint vocabulary used
    /// by the co-located storage layout (spec §6).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
            Self::Geometry => "geometry",
        }
    }
}

impl fmt::Display for PartitionDatatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PartitionDatatype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            "text" => Ok(Self::Text),
            "timestamp" => Ok(Self::Timestamp),
            "geometry" => Ok(Self::Geometry),
            other => Err(format!("unknown partition datatype '{other}'")),
        }
    }
}

/// A single partition-key identifier value.
///
/// This is the tagged-variant replacement for the source's dynamic
/// datatype dispatch (spec §9 "Dynamic datatype dispatch"): every backend
/// declares, at compile time, the subset of variants it accepts via
/// [`crate::cache::SupportedDatatypes`]-style static sets, and rejects the
/// rest with `UnsupportedDatatype`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Identifier {
    /// Integer identifier.
    Integer(i64),
    /// Floating point identifier.
    Float(f64),
    /// Text identifier.
    Text(String),
    /// Timestamp identifier, stored as milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Geometry identifier: a Well-Known Binary envelope or cell polygon,
    /// used only by the spatial bounding-box backend (H3 tessellation
    /// uses [`Self::Integer`] cell ids instead).
    Geometry(Vec<u8>),
}

impl Identifier {
    /// The [`PartitionDatatype`] this value belongs to.
    pub fn datatype(&self) -> PartitionDatatype {
        match self {
            Self::Integer(_) => PartitionDatatype::Integer,
            Self::Float(_) => PartitionDatatype::Float,
            Self::Text(_) => PartitionDatatype::Text,
            Self::Timestamp(_) => PartitionDatatype::Timestamp,
            Self::Geometry(_) => PartitionDatatype::Geometry,
        }
    }

    /// Convert to an `i64`, if this is (or losslessly represents) an
    /// integer identifier. Used by the bit-vector/roaring backends, which
    /// only ever accept [`PartitionDatatype::Integer`].
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the WKB bytes, if this is a [`Self::Geometry`] identifier.
    /// Used by the spatial bounding-box backend, the only one that stores
    /// geometry identifiers.
    pub fn as_wkb(&self) -> Option<&[u8]> {
        match self {
            Self::Geometry(v) => Some(v),
            _ => None,
        }
    }
}

impl Eq for Identifier {}

impl std::hash::Hash for Identifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::Integer(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            Self::Float(v) => {
                1u8.hash(state);
                OrderedFloat(*v).hash(state);
            }
            Self::Text(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Self::Timestamp(v) => {
                3u8.hash(state);
                v.hash(state);
            }
            Self::Geometry(v) => {
                4u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(id: &Identifier) -> u8 {
            match id {
                Identifier::Integer(_) => 0,
                Identifier::Float(_) => 1,
                Identifier::Text(_) => 2,
                Identifier::Timestamp(_) => 3,
                Identifier::Geometry(_) => 4,
            }
        }
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => OrderedFloat(*a).cmp(&OrderedFloat(*b)),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Geometry(a), Self::Geometry(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

/// A set of partition-key identifiers, as materialised by the eager cache
/// handler contract (`get`, `get_intersected`).
///
/// `BTreeSet` rather than `HashSet` so tests and debug output are
/// deterministic without an extra sort step.
pub type IdentifierSet = BTreeSet<Identifier>;
