//! Token bucket rate limiting for outbound requests.
//!
//! Each target gets one bucket holding up to `capacity` tokens, refilled
//! continuously at `tokens_per_second`. The bucket starts full, so a short
//! burst is admitted immediately and the long-run rate is bounded by the
//! refill rate: over any window of length `t`, at most `capacity + rate * t`
//! acquisitions complete.
//!
//! # Example
//!
//! ```rust,no_run
//! use profetch_core::limiter::TokenBucketLimiter;
//!
//! # async fn run() {
//! // Burst of 3, then one request every 6 seconds.
//! let limiter = TokenBucketLimiter::new(3, 10.0 / 60.0);
//! limiter.acquire().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Budget;

/// Refill math leaves tiny fractional remainders; treat these as a full token.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    fn take(&mut self) -> bool {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }
}

/// Shared, cloneable token bucket.
///
/// Waiters queue on a fair async mutex, so under a single instance tokens
/// are handed out in arrival order.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    capacity: f64,
    tokens_per_second: f64,
    bucket: Arc<Mutex<Bucket>>,
}

impl TokenBucketLimiter {
    /// Create a full bucket. `capacity` is raised to 1 and a non-positive
    /// rate falls back to one token per second; use [`Budget::validate`]
    /// to reject such values up front.
    pub fn new(capacity: u32, tokens_per_second: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        let tokens_per_second = if tokens_per_second.is_finite() && tokens_per_second > 0.0 {
            tokens_per_second
        } else {
            1.0
        };
        Self {
            capacity,
            tokens_per_second,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn from_budget(budget: &Budget) -> Self {
        Self::new(budget.bucket_capacity, budget.tokens_per_second)
    }

    /// Wait until a token is available, then consume it. Never fails.
    ///
    /// Dropping the returned future gives up the place in line.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            bucket.refill(Instant::now(), self.capacity, self.tokens_per_second);
            if bucket.take() {
                return;
            }
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.tokens_per_second);
            tracing::debug!(wait_ms = %wait.as_millis(), "Waiting for rate limiter token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume a token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut bucket) = self.bucket.try_lock() else {
            return false;
        };
        bucket.refill(Instant::now(), self.capacity, self.tokens_per_second);
        bucket.take()
    }

    /// Current fill level, including fractional tokens.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.capacity, self.tokens_per_second);
        bucket.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn tokens_per_second(&self) -> f64 {
        self.tokens_per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn initial_burst_is_immediate() {
        let limiter = TokenBucketLimiter::new(3, 1.0);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = TokenBucketLimiter::new(1, 2.0);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn never_admits_more_than_capacity_plus_rate_times_window() {
        let capacity = 3u32;
        let rate = 2.0;
        let limiter = TokenBucketLimiter::new(capacity, rate);
        let start = Instant::now();
        let mut admitted = Vec::new();
        for _ in 0..15 {
            limiter.acquire().await;
            admitted.push(start.elapsed().as_secs_f64());
        }
        // Any window [a, a + t] starting at an admission holds at most C + R*t admissions.
        for (i, &a) in admitted.iter().enumerate() {
            for (j, &b) in admitted.iter().enumerate().skip(i) {
                let count = (j - i + 1) as f64;
                let window = b - a;
                assert!(
                    count <= f64::from(capacity) + rate * window + 1e-6,
                    "{count} admissions in {window}s"
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_one_bucket() {
        let limiter = TokenBucketLimiter::new(2, 4.0);
        let start = Instant::now();
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        // 2 from the burst, 4 more at 4/s.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_does_not_wait() {
        let limiter = TokenBucketLimiter::new(1, 1.0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_fractional_and_capped() {
        let limiter = TokenBucketLimiter::new(2, 1.0);
        limiter.acquire().await;
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(500)).await;
        let available = limiter.available().await;
        assert!((available - 0.5).abs() < 1e-6, "available {available}");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!((limiter.available().await - 2.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_parameters_are_sanitised() {
        let limiter = TokenBucketLimiter::new(0, -1.0);
        assert_eq!(limiter.capacity(), 1);
        assert_eq!(limiter.tokens_per_second(), 1.0);
    }
}
