use std::time::Duration;

use rand::Rng;

/// Exponential backoff parameters for redial and re-verify loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Total jitter window as a fraction of the delay; `0.4` means ±20%.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), max: Duration::from_secs(60), jitter_factor: 0.4 }
    }
}

/// Doubling delay with randomized jitter. Never gives up; callers decide when to stop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; each call doubles the undithered delay up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = u64::try_from(self.config.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.config.max.as_millis()).unwrap_or(u64::MAX);
        let capped = base_ms.saturating_mul(1u64 << self.attempt.min(20)).min(max_ms);
        self.attempt = self.attempt.saturating_add(1);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let jitter_range = (capped as f64 * self.config.jitter_factor) as u64;
        let jitter_offset =
            if jitter_range > 0 { rand::rng().random_range(0..jitter_range) } else { 0 };
        Duration::from_millis(capped.saturating_sub(jitter_range / 2) + jitter_offset)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
