//! The in-database processor for co-located PostgreSQL backends (spec
//! §4.7): a control record stored in the database, synchronised to a
//! scheduled job that drains `Q_frag` and populates the cache atomically.
//!
//! Real `pg_cron`-style scheduling lives inside the database engine and a
//! trigger keeps the control row and the cron schedule consistent there;
//! outside that engine we re-implement the coupling as an external
//! synchroniser task (spec §9 "In-database processor trigger ->
//! scheduler coupling... re-implementing this requires either a storage
//! engine that offers equivalent hooks or an external synchroniser
//! task") — [`InDatabaseProcessor::spawn_scheduler`] reads the control row
//! on every tick and reacts to `enabled`/`period` changes made through
//! `reconfigure`, rather than relying on a database-side trigger.

use crate::db::{DbExecutor, ExecutionOptions};
use observability_deps::tracing::{debug, info, warn};
use partitioncache_cache::CacheHandler;
use partitioncache_queue::{FragmentPush, QueueHandler};
use partitioncache_time::{Time, TimeProviderRef};
use partitioncache_types::{Error, Fingerprint, QueryStatus, Result};
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The control record governing one in-database processor (spec §4.7
/// "job configuration").
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// Whether the scheduled job is active.
    pub enabled: bool,
    /// How often the job ticks.
    pub period: Duration,
    /// Table prefix shared with the co-located cache/queue tables.
    pub table_prefix: String,
    /// Partition keys this job processes. Empty means "all registered
    /// partition keys".
    pub partitions: Vec<String>,
    /// Maximum number of fragment executions running concurrently per
    /// tick.
    pub max_parallel: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: Duration::from_secs(1),
            table_prefix: "partitioncache".to_string(),
            partitions: Vec::new(),
            max_parallel: 4,
        }
    }
}

/// One row of the processor's outcome log (spec §4.7 "records outcome in
/// a log table").
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorLogEntry {
    /// When this execution ran.
    pub ran_at: Time,
    /// The fragment's fingerprint.
    pub fingerprint: Fingerprint,
    /// The partition key it populated.
    pub partition_key: String,
    /// How the execution ended.
    pub status: QueryStatus,
}

/// Control plane and scheduler for the in-database processor.
///
/// The external API this offers mirrors spec §4.7: "setup, enable/disable,
/// reconfigure, view status, view logs, run once".
#[derive(Debug)]
pub struct InDatabaseProcessor {
    pool: PgPool,
    control_prefix: String,
    time_provider: TimeProviderRef,
}

impl InDatabaseProcessor {
    /// Construct a processor over an existing pool. Call [`Self::setup`]
    /// before first use.
    pub fn new(pool: PgPool, control_prefix: impl Into<String>, time_provider: TimeProviderRef) -> Self {
        Self {
            pool,
            control_prefix: control_prefix.into(),
            time_provider,
        }
    }

    fn config_table(&self) -> String {
        format!("{}_processor_config", self.control_prefix)
    }

    fn log_table(&self) -> String {
        format!("{}_processor_log", self.control_prefix)
    }

    /// Creates the control and log tables, and inserts the single
    /// (disabled) control row if one doesn't already exist.
    pub async fn setup(&self) -> Result<()> {
        let config_table = self.config_table();
        let log_table = self.log_table();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {config_table} (
                id INTEGER PRIMARY KEY DEFAULT 1,
                enabled BOOLEAN NOT NULL DEFAULT false,
                period_seconds DOUBLE PRECISION NOT NULL DEFAULT 1.0,
                table_prefix TEXT NOT NULL,
                partitions TEXT NOT NULL DEFAULT '',
                max_parallel INTEGER NOT NULL DEFAULT 4,
                CONSTRAINT single_row CHECK (id = 1)
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {log_table} (
                id BIGSERIAL PRIMARY KEY,
                ran_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                fingerprint TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('ok','timeout','failed'))
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        sqlx::query(&format!(
            "INSERT INTO {config_table} (id, table_prefix) VALUES (1, $1)
             ON CONFLICT (id) DO NOTHING"
        ))
        .bind(&self.control_prefix)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    /// Flips `enabled` to `true`. Takes effect on the next scheduler tick.
    pub async fn enable(&self) -> Result<()> {
        self.set_enabled(true).await
    }

    /// Flips `enabled` to `false`. "Disabling is immediate for
    /// scheduling; in-flight executions run to completion" (spec §4.7
    /// "Shutdown semantics").
    pub async fn disable(&self) -> Result<()> {
        self.set_enabled(false).await
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let config_table = self.config_table();
        sqlx::query(&format!("UPDATE {config_table} SET enabled = $1 WHERE id = 1"))
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(())
    }

    /// Overwrites the control row with `config`.
    pub async fn reconfigure(&self, config: &JobConfig) -> Result<()> {
        let config_table = self.config_table();
        sqlx::query(&format!(
            "UPDATE {config_table} SET enabled = $1, period_seconds = $2, table_prefix = $3, partitions = $4, max_parallel = $5 WHERE id = 1"
        ))
        .bind(config.enabled)
        .bind(config.period.as_secs_f64())
        .bind(&config.table_prefix)
        .bind(config.partitions.join(","))
        .bind(config.max_parallel as i32)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    /// Reads the current control row.
    pub async fn status(&self) -> Result<JobConfig> {
        let config_table = self.config_table();
        let row = sqlx::query(&format!(
            "SELECT enabled, period_seconds, table_prefix, partitions, max_parallel FROM {config_table} WHERE id = 1"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;

        let partitions_raw: String = row.try_get("partitions").map_err(transient)?;
        Ok(JobConfig {
            enabled: row.try_get("enabled").map_err(transient)?,
            period: Duration::from_secs_f64(row.try_get::<f64, _>("period_seconds").map_err(transient)?),
            table_prefix: row.try_get("table_prefix").map_err(transient)?,
            partitions: partitions_raw
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            max_parallel: row.try_get::<i32, _>("max_parallel").map_err(transient)? as usize,
        })
    }

    /// The most recent `limit` log entries, newest first.
    pub async fn logs(&self, limit: usize) -> Result<Vec<ProcessorLogEntry>> {
        let log_table = self.log_table();
        let rows = sqlx::query(&format!(
            "SELECT ran_at, fingerprint, partition_key, status FROM {log_table} ORDER BY ran_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;

        rows.into_iter()
            .map(|row| {
                let ran_at: chrono::DateTime<chrono::Utc> = row.try_get("ran_at").map_err(transient)?;
                let status: String = row.try_get("status").map_err(transient)?;
                Ok(ProcessorLogEntry {
                    ran_at: Time::new(ran_at),
                    fingerprint: row
                        .try_get::<String, _>("fingerprint")
                        .map_err(transient)?
                        .parse()
                        .map_err(|_| Error::BackendTransient {
                            message: "corrupt fingerprint in processor log".to_string(),
                        })?,
                    partition_key: row.try_get("partition_key").map_err(transient)?,
                    status: status.parse().map_err(|_| Error::BackendTransient {
                        message: "corrupt status in processor log".to_string(),
                    })?,
                })
            })
            .collect()
    }

    /// Pops up to `config.max_parallel` fragments from `queue`, executes
    /// each against `executor`, writes the cache entry, and appends a log
    /// row — all within the current tick, "for each spawns an execution
    /// that runs the fragment and writes the cache entry atomically"
    /// (spec §4.7).
    pub async fn run_once(
        &self,
        queue: &dyn QueueHandler,
        cache: &dyn CacheHandler,
        executor: &dyn DbExecutor,
    ) -> Result<usize> {
        let config = self.status().await?;
        let mut processed = 0;
        // Guards against a single mismatched-partition entry being popped
        // and re-pushed in a tight loop when it's the only entry in Q_frag.
        let mut requeued = BTreeSet::new();
        for _ in 0..config.max_parallel {
            let Some(entry) = queue.pop_fragment().await? else {
                break;
            };

            if !config.partitions.is_empty() && !config.partitions.contains(&entry.partition_key) {
                if !requeued.insert(entry.fingerprint) {
                    break;
                }
                queue
                    .push_fragments(
                        &[FragmentPush {
                            query: entry.query.clone(),
                            fingerprint: entry.fingerprint,
                        }],
                        &entry.partition_key,
                        entry.partition_datatype,
                        entry.cache_backend.as_deref(),
                    )
                    .await?;
                continue;
            }

            match worker_style_execute(cache, executor, &entry).await {
                Ok(status) => {
                    self.append_log(entry.fingerprint, &entry.partition_key, status).await?;
                    processed += 1;
                }
                Err(e) => {
                    warn!(error = %e, fingerprint = %entry.fingerprint, "in-database fragment execution failed, leaving cache untouched");
                }
            }
        }
        Ok(processed)
    }

    async fn append_log(&self, fingerprint: Fingerprint, partition_key: &str, status: QueryStatus) -> Result<()> {
        let log_table = self.log_table();
        sqlx::query(&format!(
            "INSERT INTO {log_table} (ran_at, fingerprint, partition_key, status) VALUES ($1, $2, $3, $4)"
        ))
        .bind(self.time_provider.now().date_time())
        .bind(fingerprint.to_hex())
        .bind(partition_key)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    /// Runs `run_once` on an interval matching the control row's
    /// `period`, until `shutdown` is cancelled. Re-reads the control row
    /// every tick so `reconfigure`/`enable`/`disable` take effect without
    /// restarting the task (the "external synchroniser" mentioned on
    /// this type's doc comment).
    pub async fn spawn_scheduler(
        self: Arc<Self>,
        queue: Arc<dyn QueueHandler>,
        cache: Arc<dyn CacheHandler>,
        executor: Arc<dyn DbExecutor>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let config = match self.status().await {
                    Ok(c) => c,
                    Err(e) => {
                        info!(error = %e, "failed to read processor control row, retrying");
                        JobConfig::default()
                    }
                };

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!("in-database processor scheduler shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(config.period) => {}
                }

                if !config.enabled {
                    continue;
                }

                match self.run_once(queue.as_ref(), cache.as_ref(), executor.as_ref()).await {
                    Ok(processed) if processed > 0 => {
                        debug!(processed, "in-database processor tick");
                    }
                    Ok(_) => {}
                    Err(e) => info!(error = %e, "in-database processor tick failed"),
                }
            }
        })
    }
}

async fn worker_style_execute(
    cache: &dyn CacheHandler,
    executor: &dyn DbExecutor,
    entry: &partitioncache_queue::FragmentQueueEntry,
) -> Result<QueryStatus> {
    let outcome = executor
        .execute_fragment(&entry.query, entry.partition_datatype, &ExecutionOptions::default())
        .await?;
    let status = match outcome {
        crate::db::FragmentOutcome::Success(ids) => {
            cache
                .set_entry(entry.fingerprint, &entry.partition_key, Some(&ids), &entry.query, QueryStatus::Ok, true)
                .await?;
            QueryStatus::Ok
        }
        crate::db::FragmentOutcome::RowLimitExceeded => {
            cache
                .set_entry(entry.fingerprint, &entry.partition_key, None, &entry.query, QueryStatus::Failed, true)
                .await?;
            QueryStatus::Failed
        }
        crate::db::FragmentOutcome::StatementTimeout => {
            cache
                .set_entry(entry.fingerprint, &entry.partition_key, None, &entry.query, QueryStatus::Timeout, true)
                .await?;
            QueryStatus::Timeout
        }
    };
    Ok(status)
}

fn transient(e: sqlx::Error) -> Error {
    Error::BackendTransient {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_job_config_is_disabled() {
        let config = JobConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.max_parallel, 4);
    }
}
