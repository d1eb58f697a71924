//! Bounded retry with jittered exponential backoff.
//!
//! The jitter source is injected so tests can force a fixed number of
//! collisions and zero sleep time deterministically instead of depending on
//! ambient randomness.

use shared::{MAX_TRADE_ATTEMPTS, TRADE_BACKOFF_BASE_MS};
use std::time::Duration;

/// Supplies a factor in `[0, 1)` applied to each backoff delay.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Production jitter from the thread-local RNG.
#[derive(Debug, Default)]
pub struct ThreadJitter;

impl JitterSource for ThreadJitter {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Deterministic jitter for tests.
#[derive(Debug)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Attempt bound and backoff curve for one conditional-commit loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// The trading engine's policy: 15 attempts over a 10 ms base.
    pub fn trade_default() -> Self {
        RetryPolicy {
            max_attempts: MAX_TRADE_ATTEMPTS,
            base_delay: Duration::from_millis(TRADE_BACKOFF_BASE_MS),
        }
    }

    /// Delay before retry number `attempt` (zero-based):
    /// `jitter * base * 2^attempt`.
    pub fn backoff_delay(&self, attempt: u32, jitter: &dyn JitterSource) -> Duration {
        let exponential = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        Duration::from_millis((jitter.sample() * exponential) as u64)
    }
}
