//! Spatial backends (spec §4.4 "Spatial tessellation (H3)" and
//! "Spatial bounding-box"): both store a geometry-flavoured identifier
//! domain and implement [`crate::handler::SpatialCacheHandler`] on top
//! of the lazy contract.

pub mod bbox;
pub mod h3;
pub mod wkb;

pub use bbox::BboxSpatialCache;
pub use h3::H3SpatialCache;
