//! Fixed-window rate limiting
//!
//! Dampens delivery storms on public endpoints. Counters are best-effort:
//! the in-memory store is per-process, so behind several instances each one
//! counts independently. Use [`RedisRateLimitStore`] when a shared count is
//! needed; call sites only see [`RateLimiter`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

/// Windows kept in memory before expired ones are swept
const MAX_TRACKED_WINDOWS: usize = 10_000;

/// Share of the cap evicted at once when live windows fill it
const EVICTION_DIVISOR: usize = 10;

const REDIS_KEY_PREFIX: &str = "recap:ratelimit:";

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(e: redis::RedisError) -> Self {
        RateLimitError::Backend(e.to_string())
    }
}

/// Outcome of a single rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// The request exceeded the limit for the current window
    pub limited: bool,
    /// Requests still allowed in the current window
    pub remaining: u32,
    /// Time until the current window resets
    pub reset_after: Duration,
}

impl RateLimitResult {
    /// Seconds a limited caller should wait, rounded up
    pub fn retry_after_seconds(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

/// Backend holding the per-key window counters
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one hit against `key` and report the state of its window
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError>;
}

/// Rate limiter facade shared through application state
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// Per-process counters
    pub fn new_in_memory() -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::default()))
    }

    /// Counters shared by every instance connected to the same Redis
    pub fn new_redis(conn: ConnectionManager) -> Self {
        Self::new(Arc::new(RedisRateLimitStore::new(conn)))
    }

    /// Check (and count) a request for `key`
    pub async fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError> {
        self.store.hit(key, limit, window).await
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// In-process fixed-window counters.
///
/// Holds at most `max_windows` keys. When every tracked window is still
/// live, the oldest ones are evicted; an evicted key starts a fresh window.
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<String, Window>>,
    max_windows: usize,
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self::with_max_windows(MAX_TRACKED_WINDOWS)
    }
}

impl InMemoryRateLimitStore {
    pub fn with_max_windows(max_windows: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_windows: max_windows.max(1),
        }
    }

    /// Number of keys currently tracked
    pub async fn tracked_windows(&self) -> usize {
        self.windows.lock().await.len()
    }
}

/// Drop the `count` windows that started earliest
fn evict_oldest(windows: &mut HashMap<String, Window>, count: usize) {
    let mut by_age: Vec<(Instant, String)> = windows
        .iter()
        .map(|(key, w)| (w.started_at, key.clone()))
        .collect();
    let count = count.min(by_age.len());
    if count == 0 {
        return;
    }

    by_age.select_nth_unstable_by_key(count - 1, |(started_at, _)| *started_at);
    for (_, key) in by_age.into_iter().take(count) {
        windows.remove(&key);
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if windows.len() >= self.max_windows && !windows.contains_key(key) {
            windows.retain(|_, w| now.duration_since(w.started_at) < window);
            if windows.len() >= self.max_windows {
                let batch = (self.max_windows / EVICTION_DIVISOR).max(1);
                let excess = windows.len() + batch - self.max_windows;
                evict_oldest(&mut windows, excess);
            }
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= window {
            *entry = Window {
                started_at: now,
                count: 0,
            };
        }

        entry.count = entry.count.saturating_add(1);
        let reset_after = window.saturating_sub(now.duration_since(entry.started_at));

        Ok(RateLimitResult {
            limited: entry.count > limit,
            remaining: limit.saturating_sub(entry.count),
            reset_after,
        })
    }
}

/// Redis-backed fixed-window counters
#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
}

impl RedisRateLimitStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError> {
        let redis_key = format!("{REDIS_KEY_PREFIX}{key}");
        let window_ms = window.as_millis() as u64;
        let mut conn = self.conn.clone();

        // SET NX starts the window with its expiry; INCR counts the hit
        let (count, ttl_ms): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&redis_key)
            .arg(0)
            .arg("NX")
            .arg("PX")
            .arg(window_ms)
            .ignore()
            .incr(&redis_key, 1)
            .pttl(&redis_key)
            .query_async(&mut conn)
            .await?;

        let count = u32::try_from(count).unwrap_or(u32::MAX);
        let reset_after = if ttl_ms > 0 {
            Duration::from_millis(ttl_ms as u64)
        } else {
            window
        };

        Ok(RateLimitResult {
            limited: count > limit,
            remaining: limit.saturating_sub(count),
            reset_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_allowed() {
        let limiter = RateLimiter::new_in_memory();

        let result = limiter
            .check("wh_1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!result.limited, "First request should be allowed");
        assert_eq!(result.remaining, 9);
        assert!(result.reset_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_request_over_limit_rejected() {
        let limiter = RateLimiter::new_in_memory();

        for i in 0..3 {
            let result = limiter
                .check("wh_1", 3, Duration::from_secs(60))
                .await
                .unwrap();
            assert!(!result.limited, "Request {} should be allowed", i);
        }

        let result = limiter
            .check("wh_1", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result.limited, "4th request should be rejected");
        assert_eq!(result.remaining, 0);
        assert!(result.retry_after_seconds() >= 1);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let limiter = RateLimiter::new_in_memory();

        for _ in 0..2 {
            limiter
                .check("wh_a", 2, Duration::from_secs(60))
                .await
                .unwrap();
        }

        let a = limiter
            .check("wh_a", 2, Duration::from_secs(60))
            .await
            .unwrap();
        let b = limiter
            .check("wh_b", 2, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(a.limited);
        assert!(!b.limited);
    }

    #[tokio::test]
    async fn test_window_resets_after_expiry() {
        let limiter = RateLimiter::new_in_memory();
        let window = Duration::from_millis(20);

        limiter.check("wh_1", 1, window).await.unwrap();
        let limited = limiter.check("wh_1", 1, window).await.unwrap();
        assert!(limited.limited);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = limiter.check("wh_1", 1, window).await.unwrap();
        assert!(!fresh.limited, "New window should allow the request");
    }

    #[tokio::test]
    async fn test_live_windows_stay_bounded() {
        let store = Arc::new(InMemoryRateLimitStore::with_max_windows(100));
        let limiter = RateLimiter::new(store.clone());

        for i in 0..150 {
            limiter
                .check(&format!("wh_{i}"), 10, Duration::from_secs(60))
                .await
                .unwrap();
            assert!(store.tracked_windows().await <= 100);
        }

        // The most recent key survived eviction and kept its count
        let recent = limiter
            .check("wh_149", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(recent.remaining, 8);
    }

    #[tokio::test]
    async fn test_default_cap_holds_under_distinct_keys() {
        let store = Arc::new(InMemoryRateLimitStore::default());
        let limiter = RateLimiter::new(store.clone());

        for i in 0..15_000 {
            limiter
                .check(&format!("wh_{i}"), 10, Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert!(store.tracked_windows().await <= MAX_TRACKED_WINDOWS);
    }

    #[tokio::test]
    async fn test_concurrent_hits_respect_limit() {
        use tokio::sync::Barrier;

        let limiter = Arc::new(RateLimiter::new_in_memory());
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                limiter
                    .check("wh_storm", 4, Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if !handle.await.unwrap().limited {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 4, "Exactly the limit should get through");
    }
}
