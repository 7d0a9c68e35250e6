use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Raised when repeated validation failures exceed the configured budget.
///
/// The workflow treats a tripped limiter as a security-gate failure: one
/// rejected proposal is recoverable, a stream of them aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("validation-failure budget exceeded for `{key}` – retry after {retry_after:?}")]
    Exceeded {
        key: String,
        retry_after: Duration,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens replenished per second.
    pub tokens_per_second: f64,
    /// Bucket capacity.
    pub max_burst: f64,
}

impl RateLimitConfig {
    /// Allow `count` failures per minute.
    pub fn per_minute(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64 / 60.0,
            max_burst: count as f64,
        }
    }

    /// Allow `count` failures per hour.
    pub fn per_hour(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64 / 3600.0,
            max_burst: count as f64,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // 10 validation failures per minute before the gate trips.
        Self::per_minute(10)
    }
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_burst: f64) -> Self {
        Self {
            tokens: max_burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, tokens_per_second: f64, max_burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_second).min(max_burst);
        self.last_refill = now;
    }

    fn try_consume(
        &mut self,
        tokens_per_second: f64,
        max_burst: f64,
    ) -> Result<(), Duration> {
        self.refill(tokens_per_second, max_burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / tokens_per_second))
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Token-bucket limiter keyed by failure source (agent id, validator name).
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Consume one token for `key`. An `Err` means the caller has burned its
    /// failure budget and the gate should escalate.
    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.max_burst));

        match bucket.try_consume(self.config.tokens_per_second, self.config.max_burst) {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                warn!(key, ?retry_after, "validation-failure budget exceeded");
                Err(RateLimitError::Exceeded {
                    key: key.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Approximate tokens remaining for `key`.
    pub fn remaining(&self, key: &str) -> f64 {
        match self.buckets.get(key) {
            Some(bucket) => {
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                (bucket.tokens + elapsed * self.config.tokens_per_second)
                    .min(self.config.max_burst)
            }
            None => self.config.max_burst,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_within_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(5));
        for _ in 0..5 {
            assert!(limiter.check("agent:security").is_ok());
        }
    }

    #[test]
    fn rejects_past_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(3));
        for _ in 0..3 {
            limiter.check("k").unwrap();
        }
        let err = limiter.check("k").unwrap_err();
        match err {
            RateLimitError::Exceeded { key, retry_after } => {
                assert_eq!(key, "k");
                assert!(retry_after > Duration::ZERO);
            }
        }
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(1));
        limiter.check("a").unwrap();
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }

    #[test]
    fn remaining_reports_full_for_unknown_key() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(7));
        assert!((limiter.remaining("unseen") - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn remaining_decreases_after_check() {
        let limiter = RateLimiter::new(RateLimitConfig::per_hour(10));
        limiter.check("k").unwrap();
        assert!(limiter.remaining("k") < 10.0);
    }
}
