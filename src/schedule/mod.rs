//! Job timing for dispatched phase work
//!
//! - **Triggers**: next fire time for cron, interval, one-time and recurring
//!   schedules, evaluated in an IANA timezone
//! - **Retries**: capped exponential backoff for failed work
//!
//! Both are pure functions over their inputs and need no synchronization.

pub mod retry;
pub mod trigger;

use thiserror::Error;

pub use retry::{RetryConfig, RetryDecision};
pub use trigger::{
    next_run, parse_timezone, validate, Frequency, IntervalUnit, RecurringPattern, ScheduleSpec,
};

/// Malformed schedule or retry configuration.
///
/// None of these are retryable: a schedule that fails here is rejected when
/// the template carrying it is loaded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidScheduleExpression { expression: String, reason: String },

    #[error("Unsupported interval unit: {0}")]
    UnsupportedIntervalUnit(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid recurring pattern: {0}")]
    InvalidRecurringPattern(String),

    #[error("Invalid retry configuration: {0}")]
    InvalidRetryConfig(String),
}
