//! Re-read backoff policy.
//!
//! One explicit object instead of ad hoc nested timers: the engine asks for
//! the delay of attempt N, the driver runs it on a cancellable timer.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// Re-reads after the initial fetch. Bounds the total wait so a
    /// permanently offline peer never blocks the day.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            factor: 2,
            max_delay: Duration::from_secs(12),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-read `attempt` (1-based): capped exponential.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Worst-case total wait across all attempts.
    pub fn total_wait(&self) -> Duration {
        (1..=self.max_attempts).map(|a| self.delay(a)).sum()
    }
}
