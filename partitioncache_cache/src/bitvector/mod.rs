//! Fixed-width bit-vector backend (spec §4.4 "Bit-vector (co-located,
//! fixed-width)"). Integer-only: identifiers index directly into a
//! `BIT VARYING` column, so intersection is a single bitwise AND.

pub mod postgres;

pub use postgres::PgBitVectorCache;
