//! The pre-processor loop (spec §4.6): pops an original query from
//! `Q_orig`, runs the fragment generator over it, and pushes each
//! resulting `(fragment-sql, fingerprint)` pair onto `Q_frag`.

use observability_deps::tracing::{debug, error, warn};
use partitioncache_query::{generate_fragments, FragmentOptions};
use partitioncache_queue::{FragmentPush, QueueHandler};
use partitioncache_types::PartitionDatatype;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long the pre-processor sleeps after finding `Q_orig` empty before
/// polling again.
const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(500);

/// Runs the pre-processor loop until `shutdown` is cancelled, draining
/// whatever is mid-flight before returning (spec §4.6 "Workers and the
/// pre-processor observe a shared shutdown signal and drain before
/// exiting").
///
/// `fragment_options` must be the same options the apply-cache rewriter
/// uses for this partition key family, or fingerprints won't match (spec
/// §4.5 step 1).
pub async fn run_preprocessor(
    queue: &dyn QueueHandler,
    fragment_options: &FragmentOptions,
    default_cache_backend: Option<&str>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            debug!("pre-processor received shutdown signal, exiting");
            return;
        }

        let popped = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("pre-processor cancelled at queue poll boundary");
                return;
            }
            popped = queue.pop_original() => popped,
        };

        let entry = match popped {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tokio::time::sleep(DEFAULT_IDLE_POLL).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "failed to pop original query, retrying after idle poll");
                tokio::time::sleep(DEFAULT_IDLE_POLL).await;
                continue;
            }
        };

        let datatype = entry.partition_datatype.unwrap_or(PartitionDatatype::Integer);
        let fragments = match generate_fragments(&entry.query, &entry.partition_key, fragment_options) {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, partition_key = %entry.partition_key, "failed to generate fragments, dropping query");
                continue;
            }
        };

        let pushes: Vec<FragmentPush> = fragments
            .fragments
            .iter()
            .map(|f| FragmentPush {
                query: f.sql.clone(),
                fingerprint: f.fingerprint,
            })
            .collect();

        if pushes.is_empty() {
            continue;
        }

        if let Err(e) = queue
            .push_fragments(&pushes, &entry.partition_key, datatype, default_cache_backend)
            .await
        {
            error!(error = %e, partition_key = %entry.partition_key, "failed to push generated fragments");
        } else {
            debug!(
                partition_key = %entry.partition_key,
                fragment_count = pushes.len(),
                "enqueued generated fragments"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partitioncache_queue::InMemoryQueueHandler;

    #[tokio::test]
    async fn turns_one_original_query_into_fragments_on_the_fragment_queue() {
        let queue = InMemoryQueueHandler::new();
        queue
            .push_original("SELECT * FROM users t1 WHERE t1.zip = 1001", "zip", None)
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let options = FragmentOptions::default();

        // `run_preprocessor` otherwise polls forever, so race it against a
        // delayed cancellation: by the time the canceller fires, the single
        // queued entry has long since been drained and pushed as fragments.
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        };
        tokio::join!(run_preprocessor(&queue, &options, None, shutdown.clone()), canceller);

        let lengths = queue.queue_lengths().await.unwrap();
        assert!(lengths.fragment >= 1, "expected at least one fragment enqueued");
    }
}
