//! Per-source rate limiting over fixed 60-second windows.
//!
//! Counts live in the database so the limit holds across instances; an
//! atomic upsert-and-increment makes concurrent requests race-free. A small
//! in-memory cache short-circuits sources that are already over the limit
//! in the current window, sparing the database a write per flooded request.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use billhook_core::error::Result;

/// Window length. Counts reset on fixed wall-clock boundaries.
pub const WINDOW_SECONDS: i64 = 60;

/// Durable counter backing the limiter.
pub trait RateStore: Send + Sync + 'static {
    /// Atomically increments the count for `source` in the window
    /// containing `now` and returns the new count.
    fn increment(
        &self,
        source: &str,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>>;

    /// Deletes windows that ended before the cutoff, returning how many
    /// rows were removed.
    fn prune_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

impl RateStore for billhook_core::storage::Storage {
    fn increment(
        &self,
        source: &str,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>> {
        let rate_limits = self.rate_limits.clone();
        let source = source.to_string();
        Box::pin(async move { rate_limits.increment(&source, now, window).await })
    }

    fn prune_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        let rate_limits = self.rate_limits.clone();
        Box::pin(async move { rate_limits.prune_before(cutoff).await })
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Under the limit; let the request through.
    Allowed,
    /// Over the limit for this window.
    Limited,
}

#[derive(Debug, Clone, Copy)]
struct HotWindow {
    window_start: i64,
    count: i64,
}

/// Fixed-window limiter with a durable count and an in-memory fast path.
pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    max_per_window: i64,
    hot: Mutex<HashMap<String, HotWindow>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_per_window` requests per source per
    /// window.
    pub fn new(store: Arc<dyn RateStore>, max_per_window: i64) -> Self {
        Self { store, max_per_window, hot: Mutex::new(HashMap::new()) }
    }

    /// Checks whether a request from `source` may proceed.
    ///
    /// The durable count is authoritative; the cache only repeats a
    /// rejection already recorded for the current window.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the durable increment.
    pub async fn check(&self, source: &str, now: DateTime<Utc>) -> Result<RateDecision> {
        let window_start = window_start(now);

        {
            let hot = self.hot.lock().await;
            if let Some(entry) = hot.get(source) {
                if entry.window_start == window_start && entry.count > self.max_per_window {
                    return Ok(RateDecision::Limited);
                }
            }
        }

        let count =
            self.store.increment(source, now, chrono::Duration::seconds(WINDOW_SECONDS)).await?;

        let mut hot = self.hot.lock().await;
        hot.insert(source.to_string(), HotWindow { window_start, count });

        if count > self.max_per_window {
            warn!(source, count, limit = self.max_per_window, "source rate limited");
            Ok(RateDecision::Limited)
        } else {
            Ok(RateDecision::Allowed)
        }
    }

    /// Expires windows older than the one containing `now`.
    ///
    /// Past windows are never consulted again, so both the durable rows
    /// and the cached entries for them are dead weight. Returns how many
    /// durable rows were removed.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the durable delete.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let current = window_start(now);

        let pruned = self
            .store
            .prune_before(DateTime::from_timestamp(current, 0).unwrap_or(now))
            .await?;

        let mut hot = self.hot.lock().await;
        hot.retain(|_, entry| entry.window_start == current);

        Ok(pruned)
    }
}

fn window_start(now: DateTime<Utc>) -> i64 {
    let secs = now.timestamp();
    secs - secs.rem_euclid(WINDOW_SECONDS)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Counts per (source, window) in memory, tracking how often the
    /// durable path is hit.
    struct MemoryStore {
        counts: Mutex<HashMap<(String, i64), i64>>,
        calls: AtomicU64,
    }

    impl MemoryStore {
        fn new() -> Self {
            Self { counts: Mutex::new(HashMap::new()), calls: AtomicU64::new(0) }
        }
    }

    impl RateStore for MemoryStore {
        fn increment(
            &self,
            source: &str,
            now: DateTime<Utc>,
            _window: chrono::Duration,
        ) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>> {
            let key = (source.to_string(), window_start(now));
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let mut counts = self.counts.lock().await;
                let count = counts.entry(key).or_insert(0);
                *count += 1;
                Ok(*count)
            })
        }

        fn prune_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move {
                let mut counts = self.counts.lock().await;
                let before = counts.len();
                counts.retain(|(_, start), _| *start >= cutoff.timestamp());
                Ok((before - counts.len()) as u64)
            })
        }
    }

    #[tokio::test]
    async fn requests_allowed_up_to_limit() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), 3);
        let now = Utc::now();

        for _ in 0..3 {
            assert_eq!(limiter.check("acme", now).await.unwrap(), RateDecision::Allowed);
        }
        assert_eq!(limiter.check("acme", now).await.unwrap(), RateDecision::Limited);
    }

    #[tokio::test]
    async fn fast_reject_skips_durable_count() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), 1);
        let now = Utc::now();

        limiter.check("acme", now).await.unwrap();
        limiter.check("acme", now).await.unwrap();
        let calls_after_limit = store.calls.load(Ordering::SeqCst);

        // Already rejected for this window; no further durable writes.
        assert_eq!(limiter.check("acme", now).await.unwrap(), RateDecision::Limited);
        assert_eq!(store.calls.load(Ordering::SeqCst), calls_after_limit);
    }

    #[tokio::test]
    async fn new_window_resets_the_count() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), 1);
        let now = Utc::now();

        limiter.check("acme", now).await.unwrap();
        assert_eq!(limiter.check("acme", now).await.unwrap(), RateDecision::Limited);

        let next_window = now + chrono::Duration::seconds(WINDOW_SECONDS);
        assert_eq!(limiter.check("acme", next_window).await.unwrap(), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn prune_drops_expired_windows_only() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), 10);
        let now = Utc::now();

        limiter.check("acme", now - chrono::Duration::seconds(2 * WINDOW_SECONDS)).await.unwrap();
        limiter.check("acme", now - chrono::Duration::seconds(WINDOW_SECONDS)).await.unwrap();
        limiter.check("acme", now).await.unwrap();

        let pruned = limiter.prune_expired(now).await.unwrap();
        assert_eq!(pruned, 2);

        // The current window's count survives the prune.
        assert_eq!(store.counts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn prune_evicts_stale_fast_reject_entries() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), 1);
        let old = Utc::now() - chrono::Duration::seconds(WINDOW_SECONDS);

        limiter.check("acme", old).await.unwrap();
        assert_eq!(limiter.check("acme", old).await.unwrap(), RateDecision::Limited);

        let now = Utc::now();
        limiter.prune_expired(now).await.unwrap();

        // A fresh window starts clean; the cached rejection is gone too.
        assert_eq!(limiter.check("acme", now).await.unwrap(), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn sources_are_limited_independently() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), 1);
        let now = Utc::now();

        limiter.check("acme", now).await.unwrap();
        assert_eq!(limiter.check("acme", now).await.unwrap(), RateDecision::Limited);
        assert_eq!(limiter.check("globex", now).await.unwrap(), RateDecision::Allowed);
    }
}
