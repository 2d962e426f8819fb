//! Bounded exponential backoff for transport connections.

use std::time::Duration;

/// Backoff schedule: the delay doubles each attempt, capped at `max_delay`,
/// with a hard attempt cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after the given failed attempt (1-indexed).
    ///
    /// Returns `None` once the attempt cap is reached.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(multiplier);
        Some(Duration::from_millis(
            delay_ms.min(self.max_delay.as_millis() as u64),
        ))
    }
}
