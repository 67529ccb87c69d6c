//! Standard 5-field cron expression evaluation.
//!
//! The scheduler needs exactly two things: parse `minute hour day month
//! weekday`, and compute the next matching instant after a reference time.
//! Field grammar: `*`, single values, comma lists, `a-b` ranges, and `/step`
//! over `*` or a range. Weekday 0 is Sunday.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    WrongFieldCount(usize),

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("value out of range: {value} not in {min}-{max}")]
    OutOfRange { value: u32, min: u32, max: u32 },
}

/// A parsed cron schedule. Each field is the expanded set of matching values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::WrongFieldCount(fields.len()));
        }

        Ok(CronSchedule {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days_of_month: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            days_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    /// Whether the given instant (at minute precision) matches.
    pub fn matches(&self, t: &DateTime<Utc>) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.days_of_month.contains(&t.day())
            && self.months.contains(&t.month())
            && self
                .days_of_week
                .contains(&t.weekday().num_days_from_sunday())
    }

    /// The next matching instant strictly after `t`.
    ///
    /// Walks forward minute by minute; any satisfiable 5-field expression
    /// matches within four years, so the bound exists only to make an
    /// unsatisfiable day-of-month (e.g. `0 0 31 2 *`) terminate.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = t
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t)
            + Duration::minutes(1);

        let four_years_of_minutes = 4 * 366 * 24 * 60;
        for _ in 0..four_years_of_minutes {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, CronParseError> {
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        expand_part(part, min, max, &mut values)?;
    }
    if values.is_empty() {
        return Err(CronParseError::InvalidField(field.to_string()));
    }
    Ok(values)
}

fn expand_part(
    part: &str,
    min: u32,
    max: u32,
    out: &mut BTreeSet<u32>,
) -> Result<(), CronParseError> {
    let (range_part, step) = match part.split_once('/') {
        Some((range, step_str)) => {
            let step: u32 = step_str
                .parse()
                .map_err(|_| CronParseError::InvalidField(part.to_string()))?;
            if step == 0 {
                return Err(CronParseError::InvalidField(part.to_string()));
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (start, end) = if range_part == "*" {
        (min, max)
    } else if let Some((lo, hi)) = range_part.split_once('-') {
        let lo: u32 = lo
            .parse()
            .map_err(|_| CronParseError::InvalidField(part.to_string()))?;
        let hi: u32 = hi
            .parse()
            .map_err(|_| CronParseError::InvalidField(part.to_string()))?;
        if lo > hi {
            return Err(CronParseError::InvalidField(part.to_string()));
        }
        (lo, hi)
    } else {
        let value: u32 = range_part
            .parse()
            .map_err(|_| CronParseError::InvalidField(part.to_string()))?;
        // "v/step" means "from v to max", a bare value matches only itself.
        if step > 1 || part.contains('/') {
            (value, max)
        } else {
            (value, value)
        }
    };

    for bound in [start, end] {
        if bound < min || bound > max {
            return Err(CronParseError::OutOfRange {
                value: bound,
                min,
                max,
            });
        }
    }

    out.extend((start..=end).step_by(step as usize));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_every_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert!(schedule.matches(&utc(2025, 6, 1, 12, 34)));
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert_eq!(
            CronSchedule::parse("* * * *").unwrap_err(),
            CronParseError::WrongFieldCount(4)
        );
        assert_eq!(
            CronSchedule::parse("* * * * * *").unwrap_err(),
            CronParseError::WrongFieldCount(6)
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            CronSchedule::parse("60 * * * *").unwrap_err(),
            CronParseError::OutOfRange { value: 60, .. }
        ));
        assert!(CronSchedule::parse("* 24 * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("* * * 13 *").is_err());
        assert!(CronSchedule::parse("* * * * 7").is_err());
    }

    #[test]
    fn rejects_garbage_fields() {
        assert!(CronSchedule::parse("a * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
    }

    #[test]
    fn next_after_daily_schedule() {
        let schedule = CronSchedule::parse("0 2 * * *").unwrap();

        let before = utc(2025, 6, 1, 1, 30);
        assert_eq!(schedule.next_after(before), Some(utc(2025, 6, 1, 2, 0)));

        let after = utc(2025, 6, 1, 2, 0);
        assert_eq!(schedule.next_after(after), Some(utc(2025, 6, 2, 2, 0)));
    }

    #[test]
    fn next_after_is_strictly_in_the_future() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let now = utc(2025, 6, 1, 12, 0);
        assert_eq!(schedule.next_after(now), Some(utc(2025, 6, 1, 12, 1)));
    }

    #[test]
    fn step_fields_expand_over_the_range() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        assert!(schedule.matches(&utc(2025, 6, 1, 9, 0)));
        assert!(schedule.matches(&utc(2025, 6, 1, 9, 45)));
        assert!(!schedule.matches(&utc(2025, 6, 1, 9, 20)));
    }

    #[test]
    fn weekday_field_uses_sunday_zero() {
        // 2025-06-02 is a Monday.
        let schedule = CronSchedule::parse("0 9 * * 1").unwrap();
        assert!(schedule.matches(&utc(2025, 6, 2, 9, 0)));
        assert!(!schedule.matches(&utc(2025, 6, 1, 9, 0)));
    }

    #[test]
    fn lists_and_ranges_combine() {
        let schedule = CronSchedule::parse("0 8-10,18 * * *").unwrap();
        for hour in [8, 9, 10, 18] {
            assert!(schedule.matches(&utc(2025, 6, 1, hour, 0)));
        }
        assert!(!schedule.matches(&utc(2025, 6, 1, 12, 0)));
    }

    #[test]
    fn unsatisfiable_schedule_returns_none() {
        // February 31st never happens.
        let schedule = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(schedule.next_after(utc(2025, 1, 1, 0, 0)), None);
    }
}
