//! Downstream trigger rate limiting
//!
//! Token buckets keyed by (project, user, sha) of the triggering pipeline.
//! Buckets live in process memory; a restart forgets them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Identity a downstream trigger is counted against
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TriggerKey {
    pub project_id: i64,
    pub user_id: Option<i64>,
    pub sha: String,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: u32,
    /// Tokens per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_full(&self) -> bool {
        self.tokens >= self.capacity as f64
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<TriggerKey, TokenBucket>>>,
    capacity: u32,
    refill_rate: f64,
}

impl RateLimiter {
    /// Allow `requests` per `window`
    pub fn new(requests: u32, window: Duration) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            capacity: requests,
            refill_rate: requests as f64 / window.as_secs_f64().max(1.0),
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    /// Consume one token for `key`; `true` when the caller is over the limit
    pub async fn throttled(&self, key: &TriggerKey) -> bool {
        let mut buckets = self.buckets.write().await;

        // Idle buckets carry no information
        if buckets.len() > 10_000 {
            buckets.retain(|_, bucket| {
                bucket.refill();
                !bucket.is_full()
            });
        }

        let bucket = buckets
            .entry(key.clone())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_rate));

        let throttled = !bucket.try_consume();
        if throttled {
            tracing::warn!(
                project_id = key.project_id,
                user_id = ?key.user_id,
                sha = %key.sha,
                "Downstream pipeline trigger rate limit exceeded"
            );
        }
        throttled
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sha: &str) -> TriggerKey {
        TriggerKey {
            project_id: 1,
            user_id: Some(2),
            sha: sha.to_string(),
        }
    }

    #[tokio::test]
    async fn test_throttles_after_capacity() {
        let limiter = RateLimiter::per_minute(3);

        for _ in 0..3 {
            assert!(!limiter.throttled(&key("abc")).await);
        }
        assert!(limiter.throttled(&key("abc")).await);

        // Other commits have their own budget
        assert!(!limiter.throttled(&key("def")).await);
    }

    #[tokio::test]
    async fn test_refills_over_time() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));

        assert!(!limiter.throttled(&key("abc")).await);
        assert!(limiter.throttled(&key("abc")).await);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!limiter.throttled(&key("abc")).await);
    }
}
