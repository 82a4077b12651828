//! Bounded exponential backoff for transient page-fetch failures.

use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Attempts per page, including the first one
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from(&RetryConfig::default())
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      max_attempts: config.max_attempts.max(1),
      base_delay: Duration::from_millis(config.base_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
    }
  }
}

impl RetryPolicy {
  /// Whether another attempt is allowed after `attempt` (1-based) failed.
  pub fn should_retry(&self, attempt: u32) -> bool {
    attempt < self.max_attempts
  }

  /// Delay after failed attempt `attempt` (1-based): base, 2x base, 4x base, ... capped.
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    self
      .base_delay
      .saturating_mul(1u32 << exponent)
      .min(self.max_delay)
  }
}
