//! Token bucket rate limiter.
//!
//! Replenishes tokens continuously at `refill_rate` per second, up to
//! `capacity`. Refill is lazy: every access first credits the tokens earned
//! since the previous access, so no background timer is needed.

use crate::clock::{default_clock, SharedClock};
use crate::error::ConfigError;
use crate::registry::Reclaim;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: f64,
}

/// A single burst-tolerant rate limiter.
///
/// All reads and writes happen under the bucket's own mutex; the lock is never
/// held across anything but arithmetic, and nothing here sleeps.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: SharedClock,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// # Examples
    /// ```
    /// use turnstile::TokenBucket;
    /// let bucket = TokenBucket::new(5, 1.0).unwrap();
    /// assert!(bucket.consume(1));
    /// ```
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self, ConfigError> {
        Self::with_clock(capacity, refill_rate, default_clock())
    }

    /// Create a full bucket reading time from `clock`.
    pub fn with_clock(
        capacity: u32,
        refill_rate: f64,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidBucketSize { provided: capacity });
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(ConfigError::InvalidRefillRate { provided: refill_rate });
        }
        Ok(Self::from_validated(capacity, refill_rate, clock))
    }

    /// Build from parameters already checked by `ThrottleConfig::validate`.
    pub(crate) fn from_validated(capacity: u32, refill_rate: f64, clock: SharedClock) -> Self {
        let capacity = f64::from(capacity);
        let now = clock.now_secs();
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: now }),
            clock,
        }
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens credited per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Try to take `n` tokens. Returns `false` without spending anything if
    /// fewer than `n` are available after refill.
    pub fn consume(&self, n: u32) -> bool {
        let cost = f64::from(n);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Estimated seconds until `n` tokens are available; zero if they already are.
    ///
    /// Concurrent consumers race for replenished tokens, so a caller that waits
    /// this long is likely, not guaranteed, to be admitted.
    pub fn get_wait_time(&self, n: u32) -> f64 {
        let cost = f64::from(n);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens >= cost {
            0.0
        } else {
            (cost - state.tokens) / self.refill_rate
        }
    }

    /// Tokens that would be available right now, computed without touching
    /// the stored state.
    pub fn available_tokens(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.projected(&state, self.clock.now_secs())
    }

    fn projected(&self, state: &BucketState, now: f64) -> f64 {
        let elapsed = (now - state.last_refill).max(0.0);
        (state.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now_secs();
        state.tokens = self.projected(state, now);
        state.last_refill = now.max(state.last_refill);
    }
}

impl Reclaim for TokenBucket {
    fn at_rest(&self) -> bool {
        self.available_tokens() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn bucket(capacity: u32, rate: f64) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_clock(capacity, rate, Arc::new(clock.clone()))
            .expect("valid bucket");
        (bucket, clock)
    }

    #[test]
    fn at_rest_only_when_full() {
        let (bucket, clock) = bucket(2, 1.0);
        assert!(bucket.at_rest());
        bucket.consume(1);
        assert!(!bucket.at_rest());
        clock.advance(std::time::Duration::from_secs(1));
        assert!(bucket.at_rest());
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = TokenBucket::new(0, 1.0).expect_err("zero capacity is invalid");
        assert!(matches!(err, ConfigError::InvalidBucketSize { provided: 0 }));
    }

    #[test]
    fn rejects_non_positive_or_nan_rate() {
        assert!(TokenBucket::new(1, 0.0).is_err());
        assert!(TokenBucket::new(1, -2.0).is_err());
        assert!(TokenBucket::new(1, f64::NAN).is_err());
        assert!(TokenBucket::new(1, f64::INFINITY).is_err());
    }

    #[test]
    fn capacity_consumes_then_denies() {
        let (bucket, _clock) = bucket(5, 1.0);
        for i in 0..5 {
            assert!(bucket.consume(1), "consume #{i} should succeed");
        }
        assert!(!bucket.consume(1), "sixth consume should fail");
    }

    #[test]
    fn failed_consume_spends_nothing() {
        let (bucket, _clock) = bucket(3, 1.0);
        assert!(bucket.consume(2));
        assert!(!bucket.consume(2));
        assert!((bucket.available_tokens() - 1.0).abs() < 1e-9);
        assert!(bucket.consume(1));
    }

    #[test]
    fn refill_law_after_waiting_n_over_r() {
        let (bucket, clock) = bucket(10, 4.0);
        assert!(bucket.consume(10));
        assert!(!bucket.consume(3));
        clock.advance_secs(3.0 / 4.0);
        assert!(bucket.consume(3));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let (bucket, clock) = bucket(4, 100.0);
        assert!(bucket.consume(4));
        clock.advance_secs(60.0);
        assert!((bucket.available_tokens() - 4.0).abs() < 1e-9);
        assert!(bucket.consume(4));
        assert!(!bucket.consume(1));
    }

    #[test]
    fn wait_time_estimates_deficit() {
        let (bucket, clock) = bucket(5, 2.0);
        assert_eq!(bucket.get_wait_time(1), 0.0);
        assert!(bucket.consume(5));
        assert!((bucket.get_wait_time(1) - 0.5).abs() < 1e-9);
        assert!((bucket.get_wait_time(3) - 1.5).abs() < 1e-9);
        clock.advance_secs(0.25);
        assert!((bucket.get_wait_time(1) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn available_tokens_does_not_mutate() {
        let (bucket, clock) = bucket(10, 1.0);
        assert!(bucket.consume(10));
        clock.advance_secs(2.0);
        let first = bucket.available_tokens();
        let second = bucket.available_tokens();
        assert_eq!(first, second);
        assert!((first - 2.0).abs() < 1e-9);
    }

    #[test]
    fn tokens_stay_within_bounds_under_contention() {
        let bucket = Arc::new(TokenBucket::new(50, 1.0).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = bucket.clone();
                std::thread::spawn(move || (0..20).filter(|_| b.consume(1)).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // Real time passes during the test, so a handful of refilled tokens may be spent.
        assert!((50..=55).contains(&admitted), "admitted {admitted}");
        let left = bucket.available_tokens();
        assert!((0.0..=50.0).contains(&left));
    }
}
