//! Cache handler abstraction (spec §4.3) and the storage-backend
//! realisations (spec §4.4): SQL-array and external key-value value-set
//! backends, the fixed-width bit-vector backend, the run-length roaring
//! bitmap backend, and the two spatial backends.
//!
//! Every backend implements [`handler::CacheHandler`]; backends that can
//! express intersection as SQL additionally implement
//! [`handler::LazyCacheHandler`], and the two spatial backends further
//! implement [`handler::SpatialCacheHandler`]. The apply-cache rewriter
//! (`partitioncache_rewrite`) and the maintenance component
//! (`partitioncache_maintenance`) depend only on these traits, never on a
//! concrete backend type.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, missing_docs)]

pub mod bitvector;
pub mod handler;
pub mod roaring;
pub mod spatial;
pub mod value_set;

pub use handler::{CacheEntryMeta, CacheHandler, LazyCacheHandler, SpatialCacheHandler, SpatialFilter};
