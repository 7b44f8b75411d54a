//! Retry policy for re-dispatching failed work

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ScheduleError;

/// Configuration for retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_seconds: u64,
    /// Upper bound on any single delay
    pub max_delay_seconds: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_seconds: 60,
            max_delay_seconds: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

/// Outcome of consulting the retry policy after a failure
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Try again after `delay`
    Retry { next_attempt: u32, delay: Duration },
    /// The attempt budget is spent
    GiveUp { attempts: u32 },
}

impl RetryConfig {
    /// Reject configurations that cannot produce a sane backoff.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.max_attempts == 0 {
            return Err(ScheduleError::InvalidRetryConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ScheduleError::InvalidRetryConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay_seconds > self.max_delay_seconds {
            return Err(ScheduleError::InvalidRetryConfig(format!(
                "initial_delay_seconds ({}) exceeds max_delay_seconds ({})",
                self.initial_delay_seconds, self.max_delay_seconds
            )));
        }
        Ok(())
    }

    /// Delay after the `attempt`-th failure: min(max, initial × multiplier^(attempt-1)).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_seconds as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_seconds as f64).max(0.0);
        // A cap near u64::MAX rounds past what Duration can hold
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::MAX)
    }

    /// Decide what happens after `failed_attempts` attempts have failed.
    pub fn decide(&self, failed_attempts: u32) -> RetryDecision {
        if failed_attempts >= self.max_attempts {
            RetryDecision::GiveUp {
                attempts: failed_attempts,
            }
        } else {
            RetryDecision::Retry {
                next_attempt: failed_attempts + 1,
                delay: self.delay_for_attempt(failed_attempts),
            }
        }
    }
}
