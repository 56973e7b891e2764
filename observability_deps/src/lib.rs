//! A crate that re-exports the logging/tracing dependencies used across the
//! PartitionCache workspace, so every crate pulls in the same versions.

pub use tracing;
