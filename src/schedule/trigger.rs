//! Next-run calculation for scheduled jobs
//!
//! Four schedule shapes are supported:
//! - **cron**: 5-field (minute first, 0 or 7 = Sunday) or 6/7-field (seconds
//!   first, the cron crate's 1 = Sunday) expressions
//! - **interval**: every N minutes, hours or days from now
//! - **one_time**: a single absolute instant
//! - **recurring**: a structured wall-clock pattern (daily, weekdays, weekly)
//!
//! ```toml
//! schedule = { type = "recurring", frequency = "weekly", time = "09:00", days_of_week = ["mon"] }
//! ```

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ScheduleError;

/// When a job should fire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Cron expression evaluated in the job's timezone
    Cron { expression: String },
    /// Fixed interval from the moment of evaluation
    Interval {
        interval_value: u32,
        interval_unit: String,
    },
    /// Single run at an absolute instant
    OneTime {
        #[serde(default)]
        run_at: Option<DateTime<Utc>>,
    },
    /// Structured wall-clock pattern
    Recurring(RecurringPattern),
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Cron { expression } => write!(f, "cron '{}'", expression),
            ScheduleSpec::Interval {
                interval_value,
                interval_unit,
            } => write!(f, "every {} {}", interval_value, interval_unit),
            ScheduleSpec::OneTime { run_at: Some(at) } => write!(f, "once at {}", at.to_rfc3339()),
            ScheduleSpec::OneTime { run_at: None } => write!(f, "once (unset)"),
            ScheduleSpec::Recurring(pattern) => write!(f, "{} at {}", pattern.frequency, pattern.time),
        }
    }
}

/// Interval units accepted by `ScheduleSpec::Interval`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    fn step(&self, value: u32) -> Option<Duration> {
        let value = i64::from(value);
        match self {
            IntervalUnit::Minutes => Duration::try_minutes(value),
            IntervalUnit::Hours => Duration::try_hours(value),
            IntervalUnit::Days => Duration::try_days(value),
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minute" | "minutes" => Ok(IntervalUnit::Minutes),
            "hour" | "hours" => Ok(IntervalUnit::Hours),
            "day" | "days" => Ok(IntervalUnit::Days),
            _ => Err(ScheduleError::UnsupportedIntervalUnit(s.to_string())),
        }
    }
}

/// How often a recurring pattern fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// Every day
    Daily,
    /// Monday through Friday
    Weekdays,
    /// On the listed `days_of_week`
    Weekly,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekdays => write!(f, "weekdays"),
            Frequency::Weekly => write!(f, "weekly"),
        }
    }
}

/// Wall-clock recurrence, resolved in the job's timezone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringPattern {
    pub frequency: Frequency,
    /// Local time of day, `HH:MM` or `HH:MM:SS`
    pub time: String,
    /// Weekday names (`mon`, `Tuesday`, ...); required for weekly patterns
    #[serde(default)]
    pub days_of_week: Vec<String>,
}

impl RecurringPattern {
    fn wall_time(&self) -> Result<NaiveTime, ScheduleError> {
        NaiveTime::parse_from_str(&self.time, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&self.time, "%H:%M"))
            .map_err(|_| {
                ScheduleError::InvalidRecurringPattern(format!(
                    "time '{}' is not HH:MM or HH:MM:SS",
                    self.time
                ))
            })
    }

    fn weekdays(&self) -> Result<Vec<Weekday>, ScheduleError> {
        match self.frequency {
            Frequency::Daily => Ok(vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ]),
            Frequency::Weekdays => Ok(vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ]),
            Frequency::Weekly => {
                if self.days_of_week.is_empty() {
                    return Err(ScheduleError::InvalidRecurringPattern(
                        "weekly pattern needs at least one day_of_week".to_string(),
                    ));
                }
                self.days_of_week
                    .iter()
                    .map(|day| {
                        day.trim().parse::<Weekday>().map_err(|_| {
                            ScheduleError::InvalidRecurringPattern(format!(
                                "unknown weekday '{}'",
                                day
                            ))
                        })
                    })
                    .collect()
            }
        }
    }
}

/// Compute the first fire time strictly after `now`.
///
/// `Ok(None)` means the schedule has no further runs, which callers must keep
/// distinct from an error.
pub fn next_run(
    spec: &ScheduleSpec,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let tz = parse_timezone(timezone)?;

    match spec {
        ScheduleSpec::Cron { expression } => {
            let schedule = parse_cron(expression)?;
            Ok(schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|at| at.with_timezone(&Utc)))
        }
        ScheduleSpec::Interval {
            interval_value,
            interval_unit,
        } => {
            let step = interval_step(*interval_value, interval_unit)?;
            now.checked_add_signed(step)
                .map(Some)
                .ok_or_else(|| interval_too_large(*interval_value, interval_unit))
        }
        // A one-time job whose instant has passed never fires.
        ScheduleSpec::OneTime { run_at } => Ok(run_at.filter(|at| *at > now)),
        ScheduleSpec::Recurring(pattern) => next_recurring(pattern, &tz, now),
    }
}

/// Check a schedule without evaluating it against a clock.
pub fn validate(spec: &ScheduleSpec, timezone: &str) -> Result<(), ScheduleError> {
    parse_timezone(timezone)?;

    match spec {
        ScheduleSpec::Cron { expression } => parse_cron(expression).map(|_| ()),
        ScheduleSpec::Interval {
            interval_value,
            interval_unit,
        } => interval_step(*interval_value, interval_unit).map(|_| ()),
        ScheduleSpec::OneTime { .. } => Ok(()),
        ScheduleSpec::Recurring(pattern) => {
            pattern.wall_time()?;
            pattern.weekdays().map(|_| ())
        }
    }
}

/// Resolve an IANA timezone name
pub fn parse_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let trimmed = expression.trim();
    // The cron crate wants a leading seconds field
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let normalized = match fields.len() {
        _ if trimmed.starts_with('@') => trimmed.to_string(),
        5 => format!(
            "0 {} {}",
            fields[..4].join(" "),
            standard_day_of_week(fields[4], expression)?
        ),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(ScheduleError::InvalidScheduleExpression {
                expression: expression.to_string(),
                reason: format!("expected 5, 6 or 7 fields, found {}", n),
            })
        }
    };

    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidScheduleExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn interval_step(value: u32, unit: &str) -> Result<Duration, ScheduleError> {
    let unit = IntervalUnit::from_str(unit)?;
    if value == 0 {
        return Err(ScheduleError::InvalidScheduleExpression {
            expression: format!("every 0 {:?}", unit).to_lowercase(),
            reason: "interval must be at least 1".to_string(),
        });
    }
    // Anything that cannot be added to the epoch cannot be added to "now" either
    unit.step(value)
        .filter(|step| DateTime::<Utc>::UNIX_EPOCH.checked_add_signed(*step).is_some())
        .ok_or_else(|| interval_too_large(value, &format!("{:?}", unit).to_lowercase()))
}

fn interval_too_large(value: u32, unit: &str) -> ScheduleError {
    ScheduleError::InvalidScheduleExpression {
        expression: format!("every {} {}", value, unit),
        reason: "interval is out of the representable date range".to_string(),
    }
}

/// Rewrite a 5-field day-of-week (0 or 7 = Sunday) into the cron crate's
/// numbering (1 = Sunday .. 7 = Saturday). Numeric ranges and steps are
/// expanded into a list; day names pass through untouched.
fn standard_day_of_week(field: &str, expression: &str) -> Result<String, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidScheduleExpression {
        expression: expression.to_string(),
        reason,
    };
    let day = |s: &str| {
        s.parse::<u8>()
            .ok()
            .filter(|d| *d <= 7)
            .ok_or_else(|| invalid(format!("day-of-week '{}' is not 0-7", s)))
    };

    let mut days: Vec<String> = Vec::new();
    for part in field.split(',') {
        if part == "*" || part == "?" || part.chars().any(|c| c.is_ascii_alphabetic()) {
            days.push(part.to_string());
            continue;
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| invalid(format!("invalid day-of-week step '{}'", step)))?;
                (base, Some(step))
            }
            None => (part, None),
        };
        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((from, to)) => (day(from)?, day(to)?),
            // "n/step" runs to the end of the week
            None if step.is_some() => {
                let from = day(base)?;
                (from, from.max(6))
            }
            None => {
                let only = day(base)?;
                (only, only)
            }
        };
        if start > end {
            return Err(invalid(format!("day-of-week range '{}' is reversed", base)));
        }

        for d in (start..=end).step_by(step.unwrap_or(1)) {
            let mapped = (d % 7 + 1).to_string();
            if !days.contains(&mapped) {
                days.push(mapped);
            }
        }
    }

    Ok(days.join(","))
}

fn next_recurring(
    pattern: &RecurringPattern,
    tz: &Tz,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let time = pattern.wall_time()?;
    let days = pattern.weekdays()?;
    let today = now.with_timezone(tz).date_naive();

    // Today plus a full week covers every weekday at least once
    for offset in 0..=7 {
        let date = today + Duration::days(offset);
        if !days.contains(&date.weekday()) {
            continue;
        }
        if let Some(candidate) = resolve_local(tz, date.and_time(time)) {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return Ok(Some(candidate));
            }
        }
    }

    Ok(None)
}

/// Map a local wall-clock time to an instant. Ambiguous times (DST fall-back)
/// take the earliest instant; times inside a spring-forward gap move one hour
/// later.
fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
}
