//! The asynchronous population pipeline (spec §4.6) and the in-database
//! processor control plane for co-located PostgreSQL backends (spec §4.7).
//!
//! [`preprocessor::run_preprocessor`] and [`worker::spawn_worker_pool`]
//! implement the external pipeline: a pre-processor loop turning original
//! queries into fragments, and a pool of workers executing those
//! fragments and writing them into the cache. [`db::DbExecutor`] is the
//! minimal SQL-execution seam both depend on, kept independent of any
//! concrete database engine (the DuckDB accelerator stays an external,
//! pluggable collaborator per spec §1's Non-goals).
//!
//! [`db_processor::InDatabaseProcessor`] is the alternative path for
//! co-located backends: population is delegated to a scheduled job
//! reading a control row from the same database.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, missing_docs)]

pub mod db;
pub mod db_processor;
pub mod preprocessor;
pub mod worker;

pub use db::{DbExecutor, ExecutionOptions, FragmentOutcome};
pub use db_processor::{InDatabaseProcessor, JobConfig, ProcessorLogEntry};
pub use preprocessor::run_preprocessor;
pub use worker::{spawn_worker_pool, WorkerConfig};
