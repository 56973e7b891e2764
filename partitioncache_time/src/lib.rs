//! Time abstraction used by metadata age-tracking (`last_seen`, pruning,
//! advisory-lock back-off) so tests can inject a deterministic clock instead
//! of calling `SystemTime::now()`/`Utc::now()` directly.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, missing_docs)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{fmt::Debug, sync::Arc};

/// A point in time, always UTC.
///
/// Thin wrapper around [`chrono::DateTime<Utc>`] so call sites don't need to
/// depend on `chrono` directly and so [`TimeProvider`] has a single return
/// type regardless of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Construct from a `DateTime<Utc>`.
    pub fn new(t: DateTime<Utc>) -> Self {
        Self(t)
    }

    /// Construct from milliseconds since the Unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).expect("valid timestamp"))
    }

    /// The underlying `chrono` value.
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }

    /// Duration elapsed between `earlier` and `self`. Saturates at zero if
    /// `earlier` is actually later than `self`.
    pub fn checked_duration_since(&self, earlier: Self) -> std::time::Duration {
        (self.0 - earlier.0)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Provides access to the current time.
///
/// Production code uses [`SystemProvider`]; tests inject [`MockProvider`] so
/// pruning/eviction/advisory-lock-retry logic can be exercised
/// deterministically.
pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] that uses the operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new [`SystemProvider`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// [`TimeProvider`] with a fixed, externally controlled time. Used by tests.
#[derive(Debug)]
pub struct MockProvider {
    now: Mutex<Time>,
}

impl MockProvider {
    /// Create a new [`MockProvider`] fixed at `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Overwrite the current time.
    pub fn set(&self, now: Time) {
        *self.now.lock() = now;
    }

    /// Advance the current time by `duration`.
    pub fn inc(&self, duration: std::time::Duration) {
        let mut guard = self.now.lock();
        *guard = Time(guard.0 + chrono::Duration::from_std(duration).expect("duration fits"));
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.lock()
    }
}

/// Convenience alias for a shared, cloneable time provider handle.
pub type TimeProviderRef = Arc<dyn TimeProvider>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_advances() {
        let t0 = Time::from_timestamp_millis(0);
        let provider = MockProvider::new(t0);
        assert_eq!(provider.now(), t0);

        provider.inc(std::time::Duration::from_secs(5));
        assert_eq!(
            provider.now().checked_duration_since(t0),
            std::time::Duration::from_secs(5)
        );
    }

    #[test]
    fn system_provider_moves_forward() {
        let provider = SystemProvider::new();
        let a = provider.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = provider.now();
        assert!(b >= a);
    }
}
