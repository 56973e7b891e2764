//! Durable original-query and fragment queues (spec §3 "Queue entries",
//! §4.6 "Population pipeline"): the [`handler::QueueHandler`] contract,
//! its PostgreSQL realisation, and an in-memory test double.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, missing_docs)]

pub mod handler;
pub mod memory;
pub mod postgres;

pub use handler::{FragmentPush, FragmentQueueEntry, OriginalQueueEntry, QueueHandler, QueueLengths};
pub use memory::InMemoryQueueHandler;
pub use postgres::PgQueueHandler;
