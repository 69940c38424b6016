//! Cron expressions
//!
//! Standard five field expressions (`minute hour day-of-month month
//! day-of-week`) evaluated in local time, plus the `@yearly`, `@monthly`,
//! `@weekly`, `@daily`, `@hourly` and `@every <duration>` descriptors.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, LocalResult, NaiveDate, NaiveDateTime,
    TimeZone, Timelike,
};
use std::time::Duration;
use thiserror::Error;

use crate::config::parse_duration;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown descriptor: {0}")]
    UnknownDescriptor(String),

    #[error("invalid @every duration: {0}")]
    InvalidEvery(String),

    #[error("invalid {field} field: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_offset: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_offset: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_offset: 0 };
const DAY_OF_MONTH: FieldSpec =
    FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], name_offset: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES, name_offset: 1 };
// 7 is accepted as an alias for Sunday
const DAY_OF_WEEK: FieldSpec =
    FieldSpec { name: "day-of-week", min: 0, max: 7, names: DAY_NAMES, name_offset: 0 };

/// A parsed schedule that yields its next activation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronSpec),
    Every(Duration),
}

/// Bitsets of the allowed values of each field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    // `*` in a day field makes the day match an AND instead of an OR
    dom_star: bool,
    dow_star: bool,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expr = expr.trim();

        if let Some(descriptor) = expr.strip_prefix('@') {
            return Self::parse_descriptor(descriptor);
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let (minutes, _) = parse_field(fields[0], &MINUTE)?;
        let (hours, _) = parse_field(fields[1], &HOUR)?;
        let (days_of_month, dom_star) = parse_field(fields[2], &DAY_OF_MONTH)?;
        let (months, _) = parse_field(fields[3], &MONTH)?;
        let (mut days_of_week, dow_star) = parse_field(fields[4], &DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Schedule::Cron(CronSpec {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_star,
            dow_star,
        }))
    }

    fn parse_descriptor(descriptor: &str) -> Result<Self, CronError> {
        let standard = match descriptor {
            "yearly" | "annually" => "0 0 1 1 *",
            "monthly" => "0 0 1 * *",
            "weekly" => "0 0 * * 0",
            "daily" | "midnight" => "0 0 * * *",
            "hourly" => "0 * * * *",
            other => {
                let Some(every) = other.strip_prefix("every") else {
                    return Err(CronError::UnknownDescriptor(format!("@{}", other)));
                };
                let every = every.trim();
                return match parse_duration(every) {
                    Ok(d) if !d.is_zero() => Ok(Schedule::Every(d)),
                    _ => Err(CronError::InvalidEvery(every.to_string())),
                };
            }
        };
        Self::parse(standard)
    }

    /// First activation strictly after `after`
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Schedule::Every(every) => Some(after + ChronoDuration::from_std(*every).ok()?),
            Schedule::Cron(spec) => spec.next_after(after),
        }
    }
}

impl CronSpec {
    fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let start = after.naive_local().with_second(0)?.with_nanosecond(0)?;
        let mut t = start + ChronoDuration::minutes(1);
        let limit = start + ChronoDuration::days(5 * 366);

        while t < limit {
            if !has_bit(self.months, t.month()) {
                t = first_of_next_month(t.date())?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + ChronoDuration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has_bit(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + ChronoDuration::hours(1);
                continue;
            }
            if !has_bit(self.minutes, t.minute()) {
                t += ChronoDuration::minutes(1);
                continue;
            }

            match Local.from_local_datetime(&t) {
                LocalResult::Single(dt) => return Some(dt),
                LocalResult::Ambiguous(earliest, _) => return Some(earliest),
                // Skipped by a DST transition
                LocalResult::None => t += ChronoDuration::minutes(1),
            }
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has_bit(self.days_of_month, date.day());
        let dow = has_bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_star || self.dow_star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

fn has_bit(bits: u64, value: u32) -> bool {
    bits & (1 << value) != 0
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Parse one field into a bitset, reporting whether it was an unstepped `*`
fn parse_field(text: &str, spec: &FieldSpec) -> Result<(u64, bool), CronError> {
    let mut bits = 0u64;
    let mut star = false;

    for part in text.split(',') {
        let invalid = || CronError::InvalidField {
            field: spec.name,
            value: part.to_string(),
        };

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" || range == "?" {
            if step.map_or(true, |s| s == 1) {
                star = true;
            }
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, spec)?, parse_value(high, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `5/15` means every 15 starting at 5
            (value, if step.is_some() { spec.max } else { value })
        };

        if low > high {
            return Err(invalid());
        }

        let step = step.unwrap_or(1);
        let mut value = low;
        while value <= high {
            bits |= 1 << value;
            value += step;
        }
    }

    Ok((bits, star))
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u32, CronError> {
    let lowered = text.to_lowercase();
    if let Some(index) = spec.names.iter().position(|n| *n == lowered) {
        return Ok(index as u32 + spec.name_offset);
    }

    let value: u32 = text.parse().map_err(|_| CronError::InvalidField {
        field: spec.name,
        value: text.to_string(),
    })?;
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
