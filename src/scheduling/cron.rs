//! Cron expression parsing and evaluation.
//!
//! Supports standard 5-field cron expressions and a 6-field form with a
//! leading seconds field:
//! ```text
//! ┌───────────── second (0-59, 6-field form only)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31)
//! │ │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ │ ┌───────────── day of week (0-6, 0 = Sunday)
//! │ │ │ │ │ │
//! * * * * * *
//! ```
//! A 5-field expression fires at second 0.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing cron expressions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("Invalid cron expression: expected 5 or 6 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Value {value} is out of range [{min}, {max}] for {field}")]
    OutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("Invalid range: {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("Invalid step value: {0}")]
    InvalidStep(String),
}

/// A single field in a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    /// The set of valid values for this field.
    pub values: BTreeSet<u32>,
    min: u32,
    max: u32,
}

impl CronField {
    fn new(min: u32, max: u32) -> Self {
        Self {
            values: BTreeSet::new(),
            min,
            max,
        }
    }

    fn single(value: u32, min: u32, max: u32) -> Self {
        let mut field = Self::new(min, max);
        field.values.insert(value);
        field
    }

    fn parse(mut self, expr: &str) -> Result<Self, CronParseError> {
        for part in expr.split(',') {
            self.parse_part(part.trim())?;
        }
        Ok(self)
    }

    fn parse_part(&mut self, part: &str) -> Result<(), CronParseError> {
        // Step values (e.g., */5, 0-30/5)
        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str
                    .parse::<u32>()
                    .map_err(|_| CronParseError::InvalidStep(step_str.to_string()))?;
                if step == 0 {
                    return Err(CronParseError::InvalidStep("0".to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let parse_value = |s: &str, reason: &str| {
            s.parse::<u32>().map_err(|_| CronParseError::InvalidField {
                field: range_part.to_string(),
                reason: reason.to_string(),
            })
        };

        let (start, end) = if range_part == "*" || range_part == "?" {
            (self.min, self.max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let start = parse_value(lo, "invalid start of range")?;
            let end = parse_value(hi, "invalid end of range")?;
            if start > end {
                return Err(CronParseError::InvalidRange(start, end));
            }
            (start, end)
        } else {
            let value = parse_value(range_part, "invalid value")?;
            // `5/10` means "from 5 to max every 10"
            if step.is_some() {
                (value, self.max)
            } else {
                (value, value)
            }
        };

        if start < self.min || end > self.max {
            return Err(CronParseError::OutOfRange {
                field: range_part.to_string(),
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        self.values
            .extend((start..=end).step_by(step.unwrap_or(1) as usize));
        Ok(())
    }

    /// Check if a value matches this field.
    pub fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Get the next matching value >= given value.
    pub fn next(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }

    /// Get the first matching value.
    pub fn first(&self) -> Option<u32> {
        self.values.iter().next().copied()
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    expr: String,
    /// Second field (0-59).
    pub second: CronField,
    /// Minute field (0-59).
    pub minute: CronField,
    /// Hour field (0-23).
    pub hour: CronField,
    /// Day of month field (1-31).
    pub day_of_month: CronField,
    /// Month field (1-12).
    pub month: CronField,
    /// Day of week field (0-6, 0 = Sunday).
    pub day_of_week: CronField,
}

impl CronExpr {
    /// Parse a cron expression string.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();

        let (second, rest) = match parts.len() {
            5 => (CronField::single(0, 0, 59), &parts[..]),
            6 => (CronField::new(0, 59).parse(parts[0])?, &parts[1..]),
            n => return Err(CronParseError::InvalidFieldCount(n)),
        };

        Ok(Self {
            expr: expr.trim().to_string(),
            second,
            minute: CronField::new(0, 59).parse(rest[0])?,
            hour: CronField::new(0, 23).parse(rest[1])?,
            day_of_month: CronField::new(1, 31).parse(rest[2])?,
            month: CronField::new(1, 12).parse(rest[3])?,
            day_of_week: CronField::new(0, 6).parse(rest[4])?,
        })
    }

    /// The original expression string.
    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Check if a datetime matches this cron expression.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.second.matches(dt.second()) && self.matches_minute(dt)
    }

    fn matches_minute(&self, dt: &DateTime<Utc>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_of_month.matches(dt.day())
            && self.month.matches(dt.month())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }

    /// Calculate the next fire time strictly after the given datetime.
    pub fn next_run(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let truncated = after.with_nanosecond(0).unwrap_or(*after);

        // Remaining seconds within the current minute
        if self.matches_minute(&truncated) {
            if let Some(sec) = self.second.next(truncated.second() + 1) {
                return truncated.with_second(sec);
            }
        }

        let mut current = (truncated + Duration::minutes(1)).with_second(0)?;
        let first_second = self.second.first()?;

        // Search for up to 4 years (to handle leap years and edge cases)
        let max_iterations = 4 * 366 * 24 * 60;

        for _ in 0..max_iterations {
            if self.matches_minute(&current) {
                return current.with_second(first_second);
            }

            if !self.month.matches(current.month()) {
                // Skip to the next matching month, wrapping to next year
                let (year, month) = match self.month.next(current.month()) {
                    Some(m) => (current.year(), m),
                    None => (current.year() + 1, self.month.first()?),
                };
                current = NaiveDateTime::new(
                    NaiveDate::from_ymd_opt(year, month, 1)?,
                    NaiveTime::from_hms_opt(0, 0, 0)?,
                )
                .and_utc();
                continue;
            }

            current += Duration::minutes(1);
        }

        None
    }

    /// Time to wait from `now` until the next fire time.
    pub fn until_next(&self, now: &DateTime<Utc>) -> Option<std::time::Duration> {
        let next = self.next_run(now)?;
        (next - *now).to_std().ok()
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_wildcard() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert_eq!(expr.minute.values.len(), 60);
        assert_eq!(expr.hour.values.len(), 24);
        assert_eq!(expr.second.values.len(), 1);
    }

    #[test]
    fn test_parse_seconds_field() {
        let expr = CronExpr::parse("*/15 * * * * ?").unwrap();
        assert_eq!(expr.second.values.len(), 4);
        assert!(expr.second.matches(45));
        assert_eq!(expr.day_of_week.values.len(), 7);
    }

    #[test]
    fn test_parse_range_and_step() {
        let expr = CronExpr::parse("0-30/10 9-17 * * 1-5").unwrap();
        assert_eq!(expr.minute.values.iter().copied().collect::<Vec<_>>(), vec![0, 10, 20, 30]);
        assert!(expr.hour.matches(9));
        assert!(!expr.hour.matches(8));
        assert!(!expr.day_of_week.matches(0));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            CronExpr::parse("* * *").unwrap_err(),
            CronParseError::InvalidFieldCount(3)
        );
        assert!(matches!(
            CronExpr::parse("61 * * * *"),
            Err(CronParseError::OutOfRange { .. })
        ));
        assert!(matches!(
            CronExpr::parse("*/0 * * * *"),
            Err(CronParseError::InvalidStep(_))
        ));
        assert!(matches!(
            CronExpr::parse("30-10 * * * *"),
            Err(CronParseError::InvalidRange(30, 10))
        ));
    }

    #[test]
    fn test_next_run_minutes() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        let next = expr.next_run(&now).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_seconds_within_minute() {
        let expr = CronExpr::parse("*/10 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 12).unwrap();

        assert_eq!(
            expr.next_run(&now).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 20).unwrap()
        );

        let end_of_minute = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 55).unwrap();
        assert_eq!(
            expr.next_run(&end_of_minute).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 14, 31, 0).unwrap()
        );
    }

    #[test]
    fn test_next_run_month_wrap() {
        let expr = CronExpr::parse("0 0 1 2 *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();

        assert_eq!(
            expr.next_run(&now).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_until_next() {
        let expr = CronExpr::parse("* * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 12).unwrap();

        assert_eq!(expr.until_next(&now), Some(std::time::Duration::from_secs(1)));
    }
}
