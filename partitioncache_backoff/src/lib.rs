//! Backoff functionality, used for retrying `BackendTransient` errors
//! (connection lost, transaction aborted, lock timeout) encountered while
//! talking to a cache backend, queue, or target database.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use observability_deps::tracing::info;
use rand::prelude::*;
use std::ops::ControlFlow;
use std::time::Duration;

/// Exponential backoff with jitter.
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 3.,
        }
    }
}

/// Error after giving up retrying.
pub type BackoffError = std::convert::Infallible;

/// Backoff result.
pub type BackoffResult<T> = Result<T, BackoffError>;

/// [`Backoff`] can be created from a [`BackoffConfig`].
///
/// Consecutive calls to `next` return the next backoff interval.
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new [`Backoff`] with the optional `rng`.
    ///
    /// Uses [`rand::thread_rng()`] if no rng is provided.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for.
    pub fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }

    /// Perform an async operation that retries with a backoff.
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> BackoffResult<B>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = ControlFlow<B, E>> + Send,
        E: std::error::Error + Send,
    {
        loop {
            let do_stuff = do_stuff();

            let e = match do_stuff.await {
                ControlFlow::Break(r) => break Ok(r),
                ControlFlow::Continue(e) => e,
            };

            let backoff = self.next();
            info!(
                e=%e,
                task_name,
                backoff_secs = backoff.as_secs(),
                "request encountered a transient error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Retry all errors.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> BackoffResult<B>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::error::Error + Send,
    {
        self.retry_with_backoff(task_name, move || {
            let do_stuff = do_stuff();

            async {
                match do_stuff.await {
                    Ok(b) => ControlFlow::Break(b),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await
    }
}

/// Bounded poll-then-block advisory lock acquisition, used by the
/// bit-vector backend's partition bootstrap (§5 "Starting a partition key
/// creation under advisory-lock contention uses a try-lock with bounded
/// polling, then falls back to a blocking lock").
///
/// `try_acquire` should attempt a non-blocking lock acquisition and return
/// whether it succeeded. `acquire_blocking` performs a blocking acquisition
/// and is only called once polling is exhausted. Between polls, checks
/// `poll_done` — callers use this to detect that another process already
/// finished the work the lock guards, in which case this function returns
/// without ever calling `acquire_blocking`.
pub async fn try_then_block_advisory_lock<TryAcquire, Fut1, PollDone, AcquireBlocking, Fut2>(
    max_polls: usize,
    poll_interval: Duration,
    mut try_acquire: TryAcquire,
    mut poll_done: PollDone,
    acquire_blocking: AcquireBlocking,
) -> AdvisoryLockOutcome
where
    TryAcquire: FnMut() -> Fut1,
    Fut1: std::future::Future<Output = bool>,
    PollDone: FnMut() -> bool,
    AcquireBlocking: FnOnce() -> Fut2,
    Fut2: std::future::Future<Output = ()>,
{
    if try_acquire().await {
        return AdvisoryLockOutcome::AcquiredImmediately;
    }

    for _ in 0..max_polls {
        tokio::time::sleep(poll_interval).await;
        if poll_done() {
            return AdvisoryLockOutcome::CompletedByOther;
        }
    }

    acquire_blocking().await;
    AdvisoryLockOutcome::AcquiredAfterBlocking
}

/// How a [`try_then_block_advisory_lock`] call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryLockOutcome {
    /// The non-blocking try-lock succeeded on the first attempt.
    AcquiredImmediately,
    /// Another process finished the guarded work while polling; the lock
    /// was never acquired by this call.
    CompletedByOther,
    /// Polling was exhausted and the blocking acquisition succeeded.
    AcquiredAfterBlocking,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_backoff() {
        let init_backoff_secs = 1.;
        let max_backoff_secs = 500.;
        let base = 3.;

        let config = BackoffConfig {
            init_backoff: Duration::from_secs_f64(init_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            base,
        };

        let assert_fuzzy_eq = |a: f64, b: f64| assert!((b - a).abs() < 0.0001, "{} != {}", a, b);

        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for _ in 0..20 {
            assert_eq!(backoff.next().as_secs_f64(), init_backoff_secs);
        }

        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for i in 0..20 {
            let value = (base.powi(i) * init_backoff_secs).min(max_backoff_secs);
            assert_fuzzy_eq(backoff.next().as_secs_f64(), value);
        }

        let rng = Box::new(StepRng::new(u64::MAX / 2, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        let mut value = init_backoff_secs;
        for _ in 0..20 {
            assert_fuzzy_eq(backoff.next().as_secs_f64(), value);
            value =
                (init_backoff_secs + (value * base - init_backoff_secs) / 2.).min(max_backoff_secs);
        }
    }

    #[tokio::test]
    async fn advisory_lock_immediate() {
        let outcome = try_then_block_advisory_lock(
            10,
            Duration::from_millis(1),
            || async { true },
            || false,
            || async {},
        )
        .await;
        assert_eq!(outcome, AdvisoryLockOutcome::AcquiredImmediately);
    }

    #[tokio::test]
    async fn advisory_lock_completed_by_other() {
        let mut polls = 0;
        let outcome = try_then_block_advisory_lock(
            10,
            Duration::from_millis(1),
            || async { false },
            || {
                polls += 1;
                polls >= 3
            },
            || async { panic!("should not block") },
        )
        .await;
        assert_eq!(outcome, AdvisoryLockOutcome::CompletedByOther);
    }

    #[tokio::test]
    async fn advisory_lock_falls_back_to_blocking() {
        let outcome = try_then_block_advisory_lock(
            2,
            Duration::from_millis(1),
            || async { false },
            || false,
            || async {},
        )
        .await;
        assert_eq!(outcome, AdvisoryLockOutcome::AcquiredAfterBlocking);
    }
}
