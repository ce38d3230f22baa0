//! Recurrence evaluation for availability exceptions.
//!
//! The engine only needs "which spans does this rule produce inside a window",
//! so evaluation sits behind [`RecurrenceEvaluator`]. [`RRuleEvaluator`] hands
//! iCalendar rules to the `rrule` crate with the exception's own start as
//! `DTSTART`. Frequencies finer than a day are rejected, and `UNTIL` may also
//! be written as raw unix milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use rrule::{RRule, RRuleSet, Tz, Unvalidated};
use thiserror::Error;

use crate::limits::{MAX_RECURRENCE_OCCURRENCES, MAX_RRULE_LEN};
use crate::model::{Ms, Span};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("empty recurrence rule")]
    Empty,
    #[error("recurrence rule too long")]
    TooLong,
    #[error("recurrence rule has no FREQ")]
    MissingFrequency,
    #[error("unsupported recurrence frequency: {0}")]
    UnsupportedFrequency(String),
    #[error("timestamp {0} is out of range for a recurrence")]
    OutOfRange(Ms),
    #[error("{0}")]
    Rule(String),
}

/// Expands a recurrence rule into concrete occurrence spans.
pub trait RecurrenceEvaluator: Send + Sync {
    /// Check `rule` as the recurrence of a series first occurring at `seed`.
    fn validate(&self, rule: &str, seed: Span) -> Result<(), RecurrenceError>;

    /// Occurrences of a series whose first occurrence is `seed`, restricted to
    /// those overlapping `window`, in start order.
    fn occurrences(&self, rule: &str, seed: Span, window: Span)
    -> Result<Vec<Span>, RecurrenceError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RRuleEvaluator;

impl RecurrenceEvaluator for RRuleEvaluator {
    fn validate(&self, rule: &str, seed: Span) -> Result<(), RecurrenceError> {
        series(rule, seed.start).map(|_| ())
    }

    fn occurrences(
        &self,
        rule: &str,
        seed: Span,
        window: Span,
    ) -> Result<Vec<Span>, RecurrenceError> {
        let duration = seed.duration_ms();
        // DTSTART has whole seconds; the remainder rides on every occurrence.
        let sub_second = seed.start.rem_euclid(1000);
        let limit = u16::try_from(MAX_RECURRENCE_OCCURRENCES).unwrap_or(u16::MAX);
        let found = series(rule, seed.start)?
            .after(utc(window.start - duration - sub_second)?)
            .before(utc(window.end)?)
            .all(limit);
        Ok(found
            .dates
            .iter()
            .map(|dt| dt.timestamp_millis() + sub_second)
            .filter(|start| *start < window.end && start + duration > window.start)
            .map(|start| Span::new(start, start + duration))
            .collect())
    }
}

fn utc(ms: Ms) -> Result<DateTime<Tz>, RecurrenceError> {
    Tz::UTC
        .timestamp_millis_opt(ms)
        .single()
        .ok_or(RecurrenceError::OutOfRange(ms))
}

/// The series `rule` describes when its first occurrence starts at
/// `seed_start`.
fn series(rule: &str, seed_start: Ms) -> Result<RRuleSet, RecurrenceError> {
    let body = normalize(rule)?;
    let dt_start = utc(seed_start - seed_start.rem_euclid(1000))?;
    body.parse::<RRule<Unvalidated>>()
        .and_then(|rule| rule.build(dt_start))
        .map_err(|e| RecurrenceError::Rule(e.to_string()))
}

/// Rule body without the `RRULE:` prefix, upper-cased, with a millisecond
/// `UNTIL` rewritten as an iCalendar UTC timestamp.
fn normalize(rule: &str) -> Result<String, RecurrenceError> {
    let rule = rule.trim();
    if rule.is_empty() {
        return Err(RecurrenceError::Empty);
    }
    if rule.len() > MAX_RRULE_LEN {
        return Err(RecurrenceError::TooLong);
    }
    let body = rule
        .strip_prefix("RRULE:")
        .or_else(|| rule.strip_prefix("rrule:"))
        .unwrap_or(rule);

    let mut freq = None;
    let mut parts = Vec::new();
    for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = part.split_once('=') else {
            // rrule reports the malformed part.
            parts.push(part.to_string());
            continue;
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim().to_ascii_uppercase();
        match key.as_str() {
            "FREQ" => freq = Some(value.clone()),
            "UNTIL" if value.len() > 8 && value.bytes().all(|b| b.is_ascii_digit()) => {
                let until = value
                    .parse::<Ms>()
                    .ok()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .ok_or_else(|| RecurrenceError::Rule(format!("bad UNTIL value: {value}")))?;
                parts.push(format!("UNTIL={}", until.format("%Y%m%dT%H%M%SZ")));
                continue;
            }
            _ => {}
        }
        parts.push(format!("{key}={value}"));
    }

    match freq.as_deref() {
        None => Err(RecurrenceError::MissingFrequency),
        Some("DAILY" | "WEEKLY" | "MONTHLY" | "YEARLY") => Ok(parts.join(";")),
        Some(other) => Err(RecurrenceError::UnsupportedFrequency(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(year: i32, month: u32, day: u32, hour: u32) -> Ms {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    fn seed() -> Span {
        Span::new(at(2026, 1, 1, 12), at(2026, 1, 1, 13))
    }

    fn starts(rule: &str, seed: Span, window: Span) -> Vec<Ms> {
        RRuleEvaluator
            .occurrences(rule, seed, window)
            .unwrap()
            .iter()
            .map(|s| s.start)
            .collect()
    }

    #[test]
    fn rejects_garbage() {
        let e = RRuleEvaluator;
        assert_eq!(e.validate("", seed()), Err(RecurrenceError::Empty));
        assert_eq!(e.validate("INTERVAL=2", seed()), Err(RecurrenceError::MissingFrequency));
        assert!(matches!(
            e.validate("FREQ=HOURLY", seed()),
            Err(RecurrenceError::UnsupportedFrequency(_))
        ));
        assert!(matches!(e.validate("FREQ=DAILY;INTERVAL=x", seed()), Err(RecurrenceError::Rule(_))));
        assert!(matches!(e.validate("FREQ=DAILY;BOGUS", seed()), Err(RecurrenceError::Rule(_))));
        let long = format!("FREQ=DAILY;{}", "COUNT=1;".repeat(MAX_RRULE_LEN));
        assert_eq!(e.validate(&long, seed()), Err(RecurrenceError::TooLong));
    }

    #[test]
    fn non_ascii_until_is_an_error() {
        assert!(matches!(
            RRuleEvaluator.validate("FREQ=DAILY;UNTIL=20260é1", seed()),
            Err(RecurrenceError::Rule(_))
        ));
        assert!(RRuleEvaluator.validate("FREQ=DAILY;UNTIL=2026011é", seed()).is_err());
    }

    #[test]
    fn accepts_prefix_and_lowercase() {
        assert!(RRuleEvaluator.validate("RRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=WE,MO;COUNT=6", seed()).is_ok());
        assert!(RRuleEvaluator.validate("freq=daily;count=3", seed()).is_ok());
    }

    #[test]
    fn daily_occurrences_in_window() {
        let window = Span::new(at(2026, 1, 3, 0), at(2026, 1, 5, 0));
        assert_eq!(
            RRuleEvaluator.occurrences("FREQ=DAILY", seed(), window).unwrap(),
            vec![
                Span::new(at(2026, 1, 3, 12), at(2026, 1, 3, 13)),
                Span::new(at(2026, 1, 4, 12), at(2026, 1, 4, 13)),
            ]
        );
    }

    #[test]
    fn later_window_years_ahead() {
        let window = Span::new(at(2030, 6, 1, 0), at(2030, 6, 2, 0));
        assert_eq!(starts("FREQ=DAILY", seed(), window), vec![at(2030, 6, 1, 12)]);
    }

    #[test]
    fn occurrence_straddling_window_start_is_included() {
        let seed = Span::new(at(2026, 1, 1, 22), at(2026, 1, 2, 2));
        let window = Span::new(at(2026, 1, 3, 0), at(2026, 1, 3, 1));
        assert_eq!(
            RRuleEvaluator.occurrences("FREQ=DAILY", seed, window).unwrap(),
            vec![Span::new(at(2026, 1, 2, 22), at(2026, 1, 3, 2))]
        );
    }

    #[test]
    fn weekly_by_day() {
        // Seed on Monday 2026-01-05; series on Mondays and Wednesdays.
        let seed = Span::new(at(2026, 1, 5, 9), at(2026, 1, 5, 10));
        let window = Span::new(at(2026, 1, 5, 0), at(2026, 1, 19, 0));
        assert_eq!(
            starts("FREQ=WEEKLY;BYDAY=MO,WE", seed, window),
            vec![at(2026, 1, 5, 9), at(2026, 1, 7, 9), at(2026, 1, 12, 9), at(2026, 1, 14, 9)]
        );
    }

    #[test]
    fn weekly_by_day_skips_days_before_seed() {
        // Seed on Wednesday; the Monday of the same week is not an occurrence.
        let seed = Span::new(at(2026, 1, 7, 9), at(2026, 1, 7, 10));
        let window = Span::new(at(2026, 1, 5, 0), at(2026, 1, 13, 0));
        assert_eq!(
            starts("FREQ=WEEKLY;BYDAY=MO,WE", seed, window),
            vec![at(2026, 1, 7, 9), at(2026, 1, 12, 9)]
        );
    }

    #[test]
    fn count_is_counted_from_the_seed() {
        let seed = Span::new(at(2026, 1, 1, 9), at(2026, 1, 1, 10));
        let month = Span::new(at(2026, 1, 1, 0), at(2026, 2, 1, 0));
        assert_eq!(starts("FREQ=DAILY;COUNT=3", seed, month).len(), 3);
        let late = Span::new(at(2026, 1, 3, 0), at(2026, 2, 1, 0));
        assert_eq!(starts("FREQ=DAILY;COUNT=3", seed, late), vec![at(2026, 1, 3, 9)]);
    }

    #[test]
    fn until_is_inclusive_in_both_forms() {
        let seed = Span::new(at(2026, 1, 1, 9), at(2026, 1, 1, 10));
        let month = Span::new(at(2026, 1, 1, 0), at(2026, 2, 1, 0));
        assert_eq!(starts("FREQ=DAILY;UNTIL=20260103T090000Z", seed, month).len(), 3);
        let raw = format!("FREQ=DAILY;UNTIL={}", at(2026, 1, 3, 9));
        assert_eq!(starts(&raw, seed, month).len(), 3);
    }

    #[test]
    fn monthly_skips_missing_days() {
        let seed = Span::new(at(2026, 1, 31, 9), at(2026, 1, 31, 10));
        let window = Span::new(at(2026, 1, 1, 0), at(2026, 6, 1, 0));
        assert_eq!(
            starts("FREQ=MONTHLY", seed, window),
            vec![at(2026, 1, 31, 9), at(2026, 3, 31, 9), at(2026, 5, 31, 9)]
        );
    }

    #[test]
    fn yearly_holiday() {
        let seed = Span::new(at(2024, 12, 25, 0), at(2024, 12, 26, 0));
        let window = Span::new(at(2030, 12, 1, 0), at(2031, 1, 1, 0));
        assert_eq!(
            RRuleEvaluator.occurrences("FREQ=YEARLY", seed, window).unwrap(),
            vec![Span::new(at(2030, 12, 25, 0), at(2030, 12, 26, 0))]
        );
    }

    #[test]
    fn window_before_seed_is_empty() {
        let seed = Span::new(at(2026, 1, 10, 9), at(2026, 1, 10, 10));
        let window = Span::new(at(2026, 1, 1, 0), at(2026, 1, 9, 0));
        assert!(starts("FREQ=DAILY", seed, window).is_empty());
    }

    #[test]
    fn sub_second_seed_keeps_its_offset() {
        let seed = Span::new(at(2026, 1, 1, 9) + 250, at(2026, 1, 1, 10));
        let window = Span::new(at(2026, 1, 2, 0), at(2026, 1, 3, 0));
        assert_eq!(starts("FREQ=DAILY", seed, window), vec![at(2026, 1, 2, 9) + 250]);
    }
}
