//! Schedule Calculator - cron expression parsing and next-occurrence math
//!
//! Pure functions only: every computation takes its reference instant as an
//! argument, so results are reproducible and never depend on the wall clock.
//!
//! Supported syntax, five fields `minute hour day-of-month month day-of-week`:
//! - `*`, single values, ranges `a-b`, lists `a,b,c`
//! - steps `*/n`, `a-b/n`, `a/n`
//! - month names `JAN`-`DEC` and weekday names `SUN`-`SAT` (case-insensitive)
//! - weekday `7` as an alias for Sunday
//! - macros `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight`, `@hourly`
//!
//! When both day fields are restricted a day matches if *either* matches.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How far ahead `next_after` searches before declaring an expression dead.
/// Five years covers `0 0 29 2 *` from any starting point.
const SEARCH_YEARS: i32 = 5;

/// Cron parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("Empty expression")]
    Empty,

    #[error("Expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid {field} field: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("Unknown macro: {0}")]
    UnknownMacro(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Symbolic names, mapped to `min + index`
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};

const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};

const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};

const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
};

const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// Allowed values of one field as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    bits: u64,
    /// Field text started with `*` (matters for the day-of-month/day-of-week rule)
    wildcard: bool,
}

impl CronField {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
}

impl CronExpression {
    /// Parse an expression; same as `str::parse`
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(CronError::Empty);
        }

        let expanded = if trimmed.starts_with('@') {
            expand_macro(trimmed)?
        } else {
            trimmed
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut days_of_week = parse_field(parts[4], &DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            minutes: parse_field(parts[0], &MINUTE)?,
            hours: parse_field(parts[1], &HOUR)?,
            days_of_month: parse_field(parts[2], &DAY_OF_MONTH)?,
            months: parse_field(parts[3], &MONTH)?,
            days_of_week,
        })
    }

    /// The expression as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the minute containing `dt` is a scheduled minute
    pub fn matches(&self, dt: DateTime<Utc>) -> bool {
        self.minutes.contains(dt.minute())
            && self.hours.contains(dt.hour())
            && self.months.contains(dt.month())
            && self.day_matches(dt.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        if self.days_of_month.wildcard || self.days_of_week.wildcard {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// First scheduled minute strictly after `after`
    ///
    /// Returns `None` when nothing matches within the search horizon
    /// (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit_year = after.year() + SEARCH_YEARS;
        let mut candidate = minute_floor(after) + Duration::minutes(1);

        while candidate.year() <= limit_year {
            if !self.months.contains(candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate.date_naive()) {
                candidate = start_of_next_day(candidate)?;
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = hour_floor(candidate) + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }

    /// First scheduled minute at or after `reference`
    pub fn next_at_or_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after(reference - Duration::nanoseconds(1))
    }

    /// Up to `count` occurrences strictly after `from`
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut schedules = Vec::with_capacity(count);
        let mut cursor = from;
        while schedules.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    schedules.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        schedules
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Validate an expression at edit time
pub fn validate(expression: &str) -> Result<(), CronError> {
    CronExpression::parse(expression).map(|_| ())
}

/// Next due time for a schedule
///
/// The result is the first scheduled minute at or after `reference`. When
/// `last_started` is given the result is also strictly after it, so a run
/// that finishes inside its own slot is never scheduled into that slot again.
pub fn next_schedule(
    expression: &str,
    reference: DateTime<Utc>,
    last_started: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>, CronError> {
    let cron = CronExpression::parse(expression)?;
    let next = cron.next_at_or_after(reference);

    Ok(match (next, last_started) {
        (Some(next), Some(last)) if next <= last => cron.next_after(last),
        (next, _) => next,
    })
}

/// Up to `count` upcoming schedules strictly after `from`
pub fn future_schedules(
    expression: &str,
    from: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, CronError> {
    Ok(CronExpression::parse(expression)?.upcoming(from, count))
}

fn expand_macro(expression: &str) -> Result<&'static str, CronError> {
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(CronError::UnknownMacro(expression.to_string())),
    }
}

fn parse_field(text: &str, spec: &FieldSpec) -> Result<CronField, CronError> {
    let invalid = || CronError::InvalidField {
        field: spec.name,
        value: text.to_string(),
    };

    let mut bits = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(invalid());
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 || step > spec.max - spec.min + 1 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec, text)?, parse_value(b, spec, text)?)
        } else {
            let value = parse_value(range, spec, text)?;
            // `5/15` means "from 5 to the end, every 15"
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(invalid());
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            bits |= 1u64 << value;
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }

    let field = CronField {
        bits,
        wildcard: text.starts_with('*'),
    };
    if field.is_empty() {
        return Err(invalid());
    }
    Ok(field)
}

fn parse_value(token: &str, spec: &FieldSpec, field_text: &str) -> Result<u32, CronError> {
    let value = match token.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .map(|index| spec.min + index as u32)
            .ok_or_else(|| CronError::InvalidField {
                field: spec.name,
                value: field_text.to_string(),
            })?,
    };

    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

fn minute_floor(dt: DateTime<Utc>) -> DateTime<Utc> {
    let secs = dt.timestamp().div_euclid(60) * 60;
    DateTime::from_timestamp(secs, 0).unwrap_or(dt)
}

fn hour_floor(dt: DateTime<Utc>) -> DateTime<Utc> {
    let secs = dt.timestamp().div_euclid(3600) * 3600;
    DateTime::from_timestamp(secs, 0).unwrap_or(dt)
}

fn start_of_next_day(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = dt.date_naive().succ_opt()?;
    Some(next.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}
