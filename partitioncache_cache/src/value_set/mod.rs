//! Value-set backends: store identifier sets directly, as opposed to the
//! [`crate::bitvector`]/[`crate::roaring`] integer-domain backends or the
//! [`crate::spatial`] geometry backends.

pub mod postgres;
pub mod redis;

pub use postgres::PgArrayCache;
pub use redis::RedisCache;
