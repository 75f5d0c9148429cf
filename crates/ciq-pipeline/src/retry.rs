use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::job::SubtaskError;

/// Per-sub-task retry policy: bounded attempts with capped exponential
/// backoff and proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the backoff added or removed at random (0.2 == ±20 %).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(900),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: u32, rng: &mut impl Rng) -> Duration {
        let base = self.delay_for_attempt(attempt_index).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if base == 0.0 || jitter == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * jitter;
        let secs = rng.gen_range((base - spread)..=(base + spread));
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    pub fn is_retryable(&self, err: &SubtaskError) -> bool {
        err.is_transient()
    }

    /// Delay before the next attempt, or `None` when the failure is final.
    ///
    /// Rate-limit denials wait exactly as long as the limiter asks and do not
    /// use up an attempt; the job timeout bounds how long that can go on.
    pub fn next_delay(&self, attempts_used: u32, err: &SubtaskError) -> Option<Duration> {
        if let SubtaskError::RateLimited { retry_after, .. } = err {
            return Some(*retry_after);
        }
        if !self.is_retryable(err) || attempts_used >= self.max_attempts {
            return None;
        }
        Some(self.jittered_delay(attempts_used.saturating_sub(1), &mut rand::thread_rng()))
    }
}
