//! Exponential backoff for transient handler failures
//!
//! `delay(n) = min(base * 2^(n-1), cap)` where `n` is the 1-based retry
//! number. Attempts are counted including the first one, so `max_attempts = 3`
//! allows two retries.

use std::time::Duration;

use hg_config::CoordinatorSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

/// What to do after attempt `attempt` (0-based) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, next_attempt: u32 },
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&CoordinatorSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &CoordinatorSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            max_attempts: settings.max_attempts.max(1),
        }
    }

    /// Backoff before the `retry_number`-th retry (1-based)
    pub fn delay(&self, retry_number: u32) -> Duration {
        let exponent = retry_number.saturating_sub(1).min(31);
        let multiplier = 1u32 << exponent;
        self.base_delay
            .checked_mul(multiplier)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Only transient failures are ever retried; the caller decides that
    pub fn decide(&self, failed_attempt: u32, transient: bool) -> RetryDecision {
        let next_attempt = failed_attempt + 1;
        if !transient || next_attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay(next_attempt),
            next_attempt,
        }
    }
}
