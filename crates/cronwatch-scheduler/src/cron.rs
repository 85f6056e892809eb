//! Cron expression evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds), evaluated in UTC.
//! Fields: *, N, N-M, lists (N,M), steps (*/N, N-M/S, N/S), month and day names.
//! Example: "0 8 * * 1-5" = weekdays at 8:00
//!
//! Day-of-month and day-of-week follow the Vixie rule: when both are
//! restricted either may match, otherwise both must.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// How far ahead `next_after` searches before declaring an expression dead.
/// Weekday and leap-day combinations repeat every 28 years within 1901-2099.
const SEARCH_YEARS: i32 = 28;

/// Why an expression was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields (MIN HOUR DOM MON DOW), found {0}")]
    FieldCount(usize),

    #[error("{field}: cannot parse '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field}: {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field}: step must be greater than zero")]
    ZeroStep { field: &'static str },

    #[error("{field}: range {start}-{end} is inverted")]
    InvertedRange {
        field: &'static str,
        start: u32,
        end: u32,
    },

    #[error("{field}: empty list item")]
    EmptyItem { field: &'static str },

    #[error("expression '{0}' never fires")]
    Unsatisfiable(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Symbolic names, indexed from `name_base`.
    names: &'static [&'static str],
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"],
    name_base: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
    name_base: 0,
};

/// Bit set of the values a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FieldSet(u64);

impl FieldSet {
    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    fn contains(&self, value: u32) -> bool {
        self.0 & (1 << value) != 0
    }
}

/// A parsed, validated 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    /// Field text starts with `*`; drives the DOM/DOW OR rule.
    dom_star: bool,
    dow_star: bool,
}

impl CronExpression {
    /// Parse and validate an expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut days_of_week = parse_field(parts[4], &DAY_OF_WEEK)?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            source: parts.join(" "),
            minutes: parse_field(parts[0], &MINUTE)?,
            hours: parse_field(parts[1], &HOUR)?,
            days_of_month: parse_field(parts[2], &DAY_OF_MONTH)?,
            months: parse_field(parts[3], &MONTH)?,
            days_of_week,
            dom_star: parts[2].starts_with('*'),
            dow_star: parts[4].starts_with('*'),
        })
    }

    /// The normalized expression text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `t` (truncated to the minute) satisfies every field.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes.contains(t.minute())
            && self.hours.contains(t.hour())
            && self.months.contains(t.month())
            && self.matches_day(t.date_naive())
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        if self.dom_star || self.dow_star {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Earliest fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let mut candidate = truncate_to_minute(after) + Duration::minutes(1);
        let limit_year = candidate.year() + SEARCH_YEARS;

        loop {
            if candidate.year() > limit_year {
                return Err(CronError::Unsatisfiable(self.source.clone()));
            }
            if !self.months.contains(candidate.month()) {
                candidate = start_of_next_month(candidate);
                continue;
            }
            if !self.matches_day(candidate.date_naive()) {
                candidate = start_of_next_day(candidate);
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = start_of_hour(candidate) + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Ok(candidate);
        }
    }

    /// The next `count` fire instants after `after`.
    pub fn next_runs(&self, after: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>, CronError> {
        let mut runs = Vec::with_capacity(count);
        let mut cursor = after;
        for _ in 0..count {
            cursor = self.next_after(cursor)?;
            runs.push(cursor);
        }
        Ok(runs)
    }

    /// Latest fire instant at or before `t`, if one exists in the last century.
    pub fn previous_at_or_before(&self, t: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
        let mut span = Duration::hours(1);
        // Doubling spans: 2^20 hours is well over a hundred years.
        for _ in 0..20 {
            let mut cursor = t - span;
            let mut latest = None;
            loop {
                let next = self.next_after(cursor)?;
                if next > t {
                    break;
                }
                latest = Some(next);
                cursor = next;
            }
            if latest.is_some() {
                return Ok(latest);
            }
            span = span * 2;
        }
        Ok(None)
    }

    /// Gap between the next two fire instants after `t`.
    pub fn period_after(&self, t: DateTime<Utc>) -> Result<Duration, CronError> {
        let first = self.next_after(t)?;
        let second = self.next_after(first)?;
        Ok(second - first)
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

/// Parse an expression and compute the next run time strictly after `after`.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    CronExpression::parse(expression)?.next_after(after)
}

/// Parse a cron field into the set of matching values.
fn parse_field(field: &str, spec: &FieldSpec) -> Result<FieldSet, CronError> {
    let mut set = FieldSet::default();

    for item in field.split(',') {
        if item.is_empty() {
            return Err(CronError::EmptyItem { field: spec.name });
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step, spec)?)),
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // "N/S" runs from N to the field maximum.
            if step.is_some() { (value, spec.max) } else { (value, value) }
        };

        if start > end {
            return Err(CronError::InvertedRange { field: spec.name, start, end });
        }

        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            set.insert(value);
        }
    }

    Ok(set)
}

fn parse_step(step: &str, spec: &FieldSpec) -> Result<u32, CronError> {
    let n: u32 = step.parse().map_err(|_| CronError::InvalidValue {
        field: spec.name,
        value: step.to_string(),
    })?;
    if n == 0 {
        return Err(CronError::ZeroStep { field: spec.name });
    }
    Ok(n)
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32, CronError> {
    let value = match token.parse::<u32>() {
        Ok(n) => n,
        Err(_) => {
            let upper = token.to_ascii_uppercase();
            let index = spec
                .names
                .iter()
                .position(|name| *name == upper)
                .ok_or_else(|| CronError::InvalidValue {
                    field: spec.name,
                    value: token.to_string(),
                })?;
            index as u32 + spec.name_base
        }
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

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::seconds(i64::from(t.second())) - Duration::nanoseconds(i64::from(t.nanosecond()))
}

fn start_of_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t) - Duration::minutes(i64::from(t.minute()))
}

fn start_of_next_day(t: DateTime<Utc>) -> DateTime<Utc> {
    let day = t.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN))
}

fn start_of_next_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    // Day 1 always exists; fall back to the next day if chrono ever disagrees.
    match NaiveDate::from_ymd_opt(year, month, 1) {
        Some(day) => Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN)),
        None => start_of_next_day(t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let next = next_run_from_cron("0 * * * *", at(2026, 2, 22, 10, 15)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_strictly_after_boundary() {
        let next = next_run_from_cron("0 * * * *", at(2026, 2, 22, 11, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 12, 0));

        let mid_minute = at(2026, 2, 22, 10, 59) + Duration::seconds(30);
        let next = next_run_from_cron("0 * * * *", mid_minute).unwrap();
        assert_eq!(next, at(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_every_5_minutes() {
        let next = next_run_from_cron("*/5 * * * *", at(2026, 2, 22, 10, 2)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 10, 5));
    }

    #[test]
    fn test_specific_time_rolls_to_next_day() {
        let next = next_run_from_cron("0 8 * * *", at(2026, 2, 22, 9, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 8, 0));
    }

    #[test]
    fn test_lists_ranges_and_stepped_ranges() {
        // 2026-02-21 is a Saturday; next weekday slot is Monday 09:15.
        let next = next_run_from_cron("15,45 9-17/2 * * 1-5", at(2026, 2, 21, 12, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 9, 15));

        let expr = CronExpression::parse("15,45 9-17/2 * * 1-5").unwrap();
        assert!(expr.matches(at(2026, 2, 23, 11, 45)));
        assert!(!expr.matches(at(2026, 2, 23, 10, 45)));
    }

    #[test]
    fn test_value_with_step_runs_to_max() {
        let expr = CronExpression::parse("50/5 * * * *").unwrap();
        let runs = expr.next_runs(at(2026, 2, 22, 10, 0), 3).unwrap();
        assert_eq!(runs, vec![at(2026, 2, 22, 10, 50), at(2026, 2, 22, 10, 55), at(2026, 2, 22, 11, 50)]);
    }

    #[test]
    fn test_dom_or_dow_when_both_restricted() {
        // Sunday 2026-02-22: the Monday comes before the 1st.
        let next = next_run_from_cron("0 0 1 * 1", at(2026, 2, 22, 10, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 0, 0));

        // Friday 2026-02-27: the 1st (a Sunday) comes before the next Friday.
        let next = next_run_from_cron("0 0 1 * 5", at(2026, 2, 27, 12, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 1, 0, 0));
    }

    #[test]
    fn test_dom_and_dow_when_one_is_star_prefixed() {
        // Odd days (*/2 starts at 1) that are also Tuesdays: the 24th is even, March 3rd fits.
        let next = next_run_from_cron("0 0 */2 * 2", at(2026, 2, 22, 10, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 3, 0, 0));
    }

    #[test]
    fn test_sunday_as_seven() {
        let next = next_run_from_cron("0 12 * * 7", at(2026, 2, 23, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 1, 12, 0));
    }

    #[test]
    fn test_month_and_day_names() {
        // Monday 2026-03-30 07:00: the next Monday in JAN-MAR is 2027-01-04.
        let next = next_run_from_cron("30 6 * jan-MAR Mon", at(2026, 3, 30, 7, 0)).unwrap();
        assert_eq!(next, at(2027, 1, 4, 6, 30));
    }

    #[test]
    fn test_leap_day() {
        let next = next_run_from_cron("0 0 29 2 *", at(2025, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_leap_day_on_a_sunday_is_years_away() {
        // `*/7` is Sunday only and star-prefixed, so both day fields must match
        let next = next_run_from_cron("0 0 29 2 */7", at(2026, 1, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2032, 2, 29, 0, 0));
    }

    #[test]
    fn test_unsatisfiable_expression() {
        let err = next_run_from_cron("0 0 30 2 *", at(2026, 1, 1, 0, 0)).unwrap_err();
        assert!(matches!(err, CronError::Unsatisfiable(_)));
    }

    #[test]
    fn test_invalid_expressions() {
        assert_eq!(CronExpression::parse("bad").unwrap_err(), CronError::FieldCount(1));
        assert_eq!(
            CronExpression::parse("61 * * * *").unwrap_err(),
            CronError::OutOfRange { field: "minute", value: 61, min: 0, max: 59 }
        );
        assert!(matches!(
            CronExpression::parse("* 24 * * *").unwrap_err(),
            CronError::OutOfRange { field: "hour", .. }
        ));
        assert!(matches!(
            CronExpression::parse("*/0 * * * *").unwrap_err(),
            CronError::ZeroStep { .. }
        ));
        assert!(matches!(
            CronExpression::parse("* * 0 * *").unwrap_err(),
            CronError::OutOfRange { field: "day-of-month", .. }
        ));
        assert!(matches!(
            CronExpression::parse("30-10 * * * *").unwrap_err(),
            CronError::InvertedRange { .. }
        ));
        assert!(matches!(
            CronExpression::parse("1,,2 * * * *").unwrap_err(),
            CronError::EmptyItem { .. }
        ));
        assert!(matches!(
            CronExpression::parse("* * * FOO *").unwrap_err(),
            CronError::InvalidValue { .. }
        ));
        // Quartz-style "last day" is not supported.
        assert!(CronExpression::parse("45 23 L * *").is_err());
    }

    #[test]
    fn test_next_run_is_after_and_matches() {
        let expressions = [
            "*/7 * * * *",
            "0 */3 * * *",
            "15 4 1,15 * *",
            "0 9 * * 1-5",
            "0 0 1 1 *",
            "5-10/2 8-18 * 6-8 0,6",
        ];
        let instants = [
            at(2026, 2, 22, 10, 2),
            at(2026, 12, 31, 23, 59),
            at(2028, 2, 28, 23, 30),
        ];
        for expression in expressions {
            let expr = CronExpression::parse(expression).unwrap();
            for t in instants {
                let next = expr.next_after(t).unwrap();
                assert!(next > t, "{expression} from {t}");
                assert!(expr.matches(next), "{expression} gave {next}");
            }
        }
    }

    #[test]
    fn test_previous_at_or_before() {
        let expr = CronExpression::parse("*/15 * * * *").unwrap();
        assert_eq!(expr.previous_at_or_before(at(2026, 2, 22, 10, 7)).unwrap(), Some(at(2026, 2, 22, 10, 0)));
        assert_eq!(expr.previous_at_or_before(at(2026, 2, 22, 10, 15)).unwrap(), Some(at(2026, 2, 22, 10, 15)));

        let daily = CronExpression::parse("0 2 * * *").unwrap();
        assert_eq!(daily.previous_at_or_before(at(2026, 2, 22, 1, 0)).unwrap(), Some(at(2026, 2, 21, 2, 0)));
    }

    #[test]
    fn test_period_after() {
        let expr = CronExpression::parse("0 */6 * * *").unwrap();
        assert_eq!(expr.period_after(at(2026, 2, 22, 1, 0)).unwrap(), Duration::hours(6));
    }

    #[test]
    fn test_display_normalizes_whitespace() {
        let expr: CronExpression = "0   8 *  * *".parse().unwrap();
        assert_eq!(expr.to_string(), "0 8 * * *");
    }
}
