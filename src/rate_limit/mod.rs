//! Rate limiter (C2): gate requests by key and policy (spec.md §4.8).
//!
//! Two algorithms are provided, each keyed per caller-supplied string:
//! sliding window (retain timestamps, reject if the window would overflow)
//! and token bucket (continuous refill). [`MultiDimensionalRateLimiter`]
//! combines several keyed dimensions into one allow/deny decision.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_after: Duration,
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    fn allow(remaining: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_after,
            retry_after: None,
        }
    }

    fn deny(remaining: u64, reset_after: Duration, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            reset_after,
            retry_after: Some(retry_after),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlidingWindowConfig {
    pub max: u64,
    pub window: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            max: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window limiter: per key, retains timestamps within the last
/// `window`; a check for `amount` tokens is rejected if it would push the
/// count above `max`.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    keys: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: SlidingWindowConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str, amount: u64) -> RateLimitResult {
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        let timestamps = keys.entry(key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.config.window);

        let count = timestamps.len() as u64;
        if count + amount > self.config.max {
            let retry_after = timestamps
                .first()
                .map(|oldest| {
                    self.config
                        .window
                        .saturating_sub(now.duration_since(*oldest))
                })
                .unwrap_or(self.config.window);
            return RateLimitResult::deny(
                self.config.max.saturating_sub(count),
                self.config.window,
                retry_after,
            );
        }

        for _ in 0..amount {
            timestamps.push(now);
        }
        RateLimitResult::allow(
            self.config.max.saturating_sub(count + amount),
            self.config.window,
        )
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    pub max: u64,
    pub window: Duration,
    pub burst: Option<u64>,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max: 100,
            window: Duration::from_secs(60),
            burst: None,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter: per key, tokens refill continuously at
/// `max / window` and cap at `burst` (or `max` if unset).
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    keys: Mutex<HashMap<String, BucketState>>,
}

impl TokenBucketLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn refill_rate(&self) -> f64 {
        self.config.max as f64 / self.config.window.as_secs_f64()
    }

    pub async fn check(&self, key: &str, amount: u64) -> RateLimitResult {
        let now = Instant::now();
        let cap = self.config.burst.unwrap_or(self.config.max) as f64;
        let rate = self.refill_rate();

        let mut keys = self.keys.lock().await;
        let state = keys.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: cap,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(cap);
        state.last_refill = now;

        if state.tokens >= amount as f64 {
            state.tokens -= amount as f64;
            RateLimitResult::allow(state.tokens as u64, self.config.window)
        } else {
            let deficit = amount as f64 - state.tokens;
            let retry_after = Duration::from_secs_f64(deficit / rate);
            RateLimitResult::deny(state.tokens as u64, self.config.window, retry_after)
        }
    }
}

/// Either algorithm, selectable per dimension.
pub enum Limiter {
    SlidingWindow(SlidingWindowLimiter),
    TokenBucket(TokenBucketLimiter),
}

impl Limiter {
    async fn check(&self, key: &str, amount: u64) -> RateLimitResult {
        match self {
            Limiter::SlidingWindow(l) => l.check(key, amount).await,
            Limiter::TokenBucket(l) => l.check(key, amount).await,
        }
    }
}

/// Combines several keyed dimensions (e.g. `user_id`, `ip`, `endpoint`) into
/// one allow/deny decision. Overall result is `allowed` iff every dimension
/// allows; the reported `remaining`/`retry_after` are the most restrictive
/// dimension's.
pub struct MultiDimensionalRateLimiter {
    dimensions: HashMap<String, Limiter>,
}

impl MultiDimensionalRateLimiter {
    pub fn new() -> Self {
        Self {
            dimensions: HashMap::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, limiter: Limiter) -> Self {
        self.dimensions.insert(name.into(), limiter);
        self
    }

    /// `keys` maps dimension name to the key to check within that dimension.
    pub async fn check(&self, keys: &HashMap<String, String>) -> RateLimitResult {
        let mut most_restrictive: Option<RateLimitResult> = None;
        let mut all_allowed = true;

        for (dim, key) in keys {
            let Some(limiter) = self.dimensions.get(dim) else {
                continue;
            };
            let result = limiter.check(key, 1).await;
            if !result.allowed {
                all_allowed = false;
            }
            most_restrictive = Some(match most_restrictive {
                None => result,
                Some(current) => {
                    if result.remaining < current.remaining || (!result.allowed && current.allowed)
                    {
                        result
                    } else {
                        current
                    }
                }
            });
        }

        let mut result = most_restrictive.unwrap_or(RateLimitResult::allow(0, Duration::ZERO));
        result.allowed = all_allowed;
        result
    }
}

impl Default for MultiDimensionalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sliding_window_rejects_after_max() {
        let limiter = SlidingWindowLimiter::new(SlidingWindowConfig {
            max: 2,
            window: Duration::from_secs(1),
        });
        assert!(limiter.check("k", 1).await.allowed);
        assert!(limiter.check("k", 1).await.allowed);
        let result = limiter.check("k", 1).await;
        assert!(!result.allowed);
        assert!(result.retry_after.is_some());
    }

    #[tokio::test]
    async fn sliding_window_conservation_over_window() {
        let limiter = SlidingWindowLimiter::new(SlidingWindowConfig {
            max: 5,
            window: Duration::from_millis(100),
        });
        let mut allowed_count = 0;
        for _ in 0..10 {
            if limiter.check("k", 1).await.allowed {
                allowed_count += 1;
            }
        }
        assert!(allowed_count <= 5);
    }

    #[tokio::test]
    async fn token_bucket_allows_up_to_burst_then_denies() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig {
            max: 60,
            window: Duration::from_secs(60),
            burst: Some(3),
        });
        assert!(limiter.check("k", 1).await.allowed);
        assert!(limiter.check("k", 1).await.allowed);
        assert!(limiter.check("k", 1).await.allowed);
        let result = limiter.check("k", 1).await;
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig {
            max: 1000,
            window: Duration::from_secs(1),
            burst: Some(1),
        });
        assert!(limiter.check("k", 1).await.allowed);
        assert!(!limiter.check("k", 1).await.allowed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.check("k", 1).await.allowed);
    }

    #[tokio::test]
    async fn multi_dimensional_denies_if_any_dimension_denies() {
        let limiter = MultiDimensionalRateLimiter::new()
            .with_dimension(
                "user",
                Limiter::SlidingWindow(SlidingWindowLimiter::new(SlidingWindowConfig {
                    max: 100,
                    window: Duration::from_secs(60),
                })),
            )
            .with_dimension(
                "ip",
                Limiter::SlidingWindow(SlidingWindowLimiter::new(SlidingWindowConfig {
                    max: 1,
                    window: Duration::from_secs(60),
                })),
            );

        let mut keys = HashMap::new();
        keys.insert("user".to_string(), "u1".to_string());
        keys.insert("ip".to_string(), "1.1.1.1".to_string());

        assert!(limiter.check(&keys).await.allowed);
        assert!(!limiter.check(&keys).await.allowed);
    }
}
