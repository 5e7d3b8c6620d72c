//! Retry policy with exponential backoff and cap.
//!
//! Subscriber deliveries retry with `delay = base * 2^retry`, capped at
//! `max_delay`. No jitter: delays are deterministic so retry timing is
//! observable in tests.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::BrokerConfig;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Maximum number of retries (0 = initial attempt only).
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Build the policy for subscriber deliveries from broker configuration.
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_retries: config.default_max_retries,
        }
    }

    /// Same timing, different retry budget.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Backoff builder yielding exactly `max_retries` delays.
    ///
    /// Retry `n` (0-indexed) waits `base_delay * 2^n`, capped at
    /// `max_delay`. Exhaustion means the retry budget is spent.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
    }
}

#[cfg(test)]
mod tests;
