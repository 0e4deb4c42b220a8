//! Exponential backoff with jitter
//!
//! Shared by the topology reader (snapshot retries) and the route applier
//! (per-operation retries).

use std::time::Duration;

use rand::Rng;

/// Backoff settings for an operation that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before giving up (at least 1)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.initial_delay, self.max_delay)
    }

    /// Delay before retry number `attempt`, with 0.5x-1.5x jitter
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.delay_for(attempt).as_secs_f64() * jitter);
        delay.min(self.max_delay)
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}
