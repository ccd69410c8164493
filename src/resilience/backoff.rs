//! Exponential backoff.
//!
//! Pure delay computation; the caller owns the waiting.

use crate::models::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Symmetric jitter applied when enabled (±10%).
const JITTER_FACTOR: f64 = 0.1;

/// Computes `base_delay * exponential_base^attempt`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    base_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
    jitter: bool,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl BackoffStrategy {
    /// Doubling backoff with jitter.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            exponential_base: 2.0,
            jitter: true,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            exponential_base: config.exponential_base,
            jitter: config.jitter,
        }
    }

    pub fn with_exponential_base(mut self, exponential_base: f64) -> Self {
        self.exponential_base = exponential_base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before retry `attempt` (zero-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_secs = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let mut secs = raw.min(max_secs);

        if self.jitter {
            secs *= 1.0 + rand::rng().random_range(-JITTER_FACTOR..=JITTER_FACTOR);
        }

        if !secs.is_finite() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.clamp(0.0, max_secs))
    }
}
