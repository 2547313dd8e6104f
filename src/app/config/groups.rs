use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whole-run retry policy applied by the binary when a split fails with a
/// transient error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "super::serde_helpers")]
    pub base_delay: Duration,
    #[serde(with = "super::serde_helpers")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given 1-based attempt, capped at
    /// `max_delay`, with ±50% jitter when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let base = Duration::from_millis(
            (self.base_delay.as_millis() as u64).saturating_mul(multiplier),
        );
        let capped = base.min(self.max_delay);
        if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            Duration::from_millis((capped.as_millis() as f64 * factor) as u64)
        } else {
            capped
        }
    }
}
