// Rate limiting for inbound gateway traffic
// Token bucket per key: the authenticated subject, or the caller's IP

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use teller_common::{Clock, SystemClock, TellerError};

/// Rate limiter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u32,
    /// Time window in milliseconds
    pub window_ms: u64,
    /// Whether rate limiting is enabled
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 1_000,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Token bucket refilled in full once per window
struct TokenBucket {
    tokens: u32,
    last_refill: i64,
}

impl TokenBucket {
    fn try_consume(&mut self, now: i64, config: &RateLimitConfig) -> bool {
        if now - self.last_refill >= config.window_ms as i64 {
            self.tokens = config.max_requests;
            self.last_refill = now;
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one token for `key`; `RateLimited` when the bucket is empty.
    pub fn try_acquire(&self, key: &str) -> Result<(), TellerError> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = self.clock.now_millis();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: self.config.max_requests,
                last_refill: now,
            });

        if bucket.try_consume(now, &self.config) {
            Ok(())
        } else {
            Err(TellerError::RateLimited(key.to_string()))
        }
    }

    /// Drop buckets idle for more than two windows
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let horizon = 2 * self.config.window_ms as i64;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| now - bucket.last_refill < horizon);
        before - self.buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use teller_common::ManualClock;

    use super::*;

    fn limiter(max: u32) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(0));
        let config = RateLimitConfig {
            max_requests: max,
            window_ms: 1_000,
            enabled: true,
        };
        (clock.clone(), RateLimiter::with_clock(config, clock))
    }

    #[test]
    fn test_bucket_exhausts_and_refills() {
        let (clock, limiter) = limiter(2);
        assert!(limiter.try_acquire("alice").is_ok());
        assert!(limiter.try_acquire("alice").is_ok());
        let err = limiter.try_acquire("alice").unwrap_err();
        assert_eq!(err.status_code(), 429);

        clock.advance(Duration::from_millis(1_000));
        assert!(limiter.try_acquire("alice").is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let (_clock, limiter) = limiter(1);
        assert!(limiter.try_acquire("alice").is_ok());
        assert!(limiter.try_acquire("10.0.0.7").is_ok());
        assert!(limiter.try_acquire("alice").is_err());
    }

    #[test]
    fn test_disabled_never_limits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 0,
            window_ms: 1_000,
            enabled: false,
        });
        for _ in 0..10 {
            assert!(limiter.try_acquire("alice").is_ok());
        }
    }

    #[test]
    fn test_cleanup_drops_idle_buckets() {
        let (clock, limiter) = limiter(5);
        limiter.try_acquire("alice").unwrap();
        clock.advance(Duration::from_millis(1_500));
        limiter.try_acquire("bob").unwrap();
        clock.advance(Duration::from_millis(600));

        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
