//! The minimal SQL-execution interface the population pipeline and
//! in-database processor require from a target database (spec §1 "the
//! core only requires a minimal SQL-execution interface from [the target
//! database engines]").
//!
//! The DuckDB in-memory accelerator (`query_accelerator.py` in
//! `original_source/`) is an external, pluggable collaborator per spec §1's
//! explicit Non-goal — this trait is the seam it would implement; nothing
//! in this crate depends on DuckDB (or any other concrete engine)
//! directly.

use async_trait::async_trait;
use partitioncache_types::{IdentifierSet, PartitionDatatype, Result};
use std::time::Duration;

/// Per-execution limits applied when a worker runs a fragment (spec §4.6
/// "a configured statement timeout and optional row-count limit").
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    /// Statement timeout. Exceeding it yields
    /// [`FragmentOutcome::StatementTimeout`].
    pub statement_timeout: Duration,
    /// Maximum number of identifiers a fragment may return before it's
    /// considered oversize. `None` means unbounded.
    pub row_limit: Option<usize>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(30),
            row_limit: None,
        }
    }
}

/// How a fragment execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    /// The fragment executed within its limits; here is the identifier
    /// set it produced.
    Success(IdentifierSet),
    /// The fragment's result exceeded `row_limit`.
    RowLimitExceeded,
    /// The fragment's statement exceeded `statement_timeout`.
    StatementTimeout,
}

/// A database capable of executing a fragment and returning the
/// partition-key identifiers it touches.
///
/// Implemented for the co-located PostgreSQL connection used by tests and
/// the reference CLI; any engine that can run a `SELECT` and stream back
/// scalar values can implement it, which is the whole point — the pipeline
/// and in-database processor never hard-code a concrete engine.
#[async_trait]
pub trait DbExecutor: std::fmt::Debug + Send + Sync {
    /// Executes `fragment_sql`, expected to be a `SELECT` over the
    /// partition-key column of type `datatype`, and collects the
    /// distinct values into an [`IdentifierSet`] — or reports that the
    /// execution hit one of `options`' limits.
    async fn execute_fragment(
        &self,
        fragment_sql: &str,
        datatype: PartitionDatatype,
        options: &ExecutionOptions,
    ) -> Result<FragmentOutcome>;

    /// Optional warm-up hook (e.g. loading a working set into an
    /// in-memory accelerator). A no-op unless an implementation overrides
    /// it.
    async fn preload(&self) -> Result<()> {
        Ok(())
    }
}
