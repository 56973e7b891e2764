//! Run-length (roaring) bitmap backend (spec §4.4 "Run-length bitmap").
//! Same table shape as [`crate::bitvector`] but over a sparse integer
//! domain: the storage engine's `roaringbitmap` extension provides
//! `rb_build`, `rb_and_agg`, `rb_cardinality` and byte-encoded
//! serialisation, which [`croaring`] decodes in the application.

pub mod postgres;

pub use postgres::PgRoaringBitmapCache;
