//! Five-field cron grammar and next-occurrence arithmetic
//!
//! Deliberately hand-rolled rather than pulled from a crate: every entry
//! point takes an explicit `from: DateTime<Utc>` and never reads the wall
//! clock itself, so the scheduler loop (the one caller allowed to ask "what
//! time is it") is the only source of non-determinism in the whole trigger
//! path.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

use waypoint_engine::error::{ErrorCode, HasErrorCode};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression must have exactly 5 fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid {field} field '{raw}': {reason}")]
    InvalidField { field: &'static str, raw: String, reason: String },
}

impl HasErrorCode for CronError {
    fn code(&self) -> ErrorCode {
        ErrorCode::CronInvalid
    }
}

/// One of the five fields of a cron expression, reduced to the set of
/// concrete values it allows within its valid range.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSet {
    values: BTreeSet<u32>,
    /// Whether the raw field was `*` (used for day-of-month/day-of-week's
    /// OR-instead-of-AND special case below).
    is_wildcard: bool,
}

fn parse_field(raw: &str, name: &'static str, min: u32, max: u32) -> Result<FieldSet, CronError> {
    let mut values = BTreeSet::new();
    let is_wildcard = raw == "*";

    for part in raw.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| CronError::InvalidField {
                    field: name,
                    raw: raw.to_string(),
                    reason: format!("invalid step '{s}'"),
                })?;
                if step == 0 {
                    return Err(CronError::InvalidField {
                        field: name,
                        raw: raw.to_string(),
                        reason: "step cannot be zero".to_string(),
                    });
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let lo: u32 = a.parse().map_err(|_| CronError::InvalidField {
                field: name,
                raw: raw.to_string(),
                reason: format!("invalid range start '{a}'"),
            })?;
            let hi: u32 = b.parse().map_err(|_| CronError::InvalidField {
                field: name,
                raw: raw.to_string(),
                reason: format!("invalid range end '{b}'"),
            })?;
            if lo > hi {
                return Err(CronError::InvalidField {
                    field: name,
                    raw: raw.to_string(),
                    reason: format!("range start {lo} exceeds end {hi}"),
                });
            }
            (lo, hi)
        } else {
            let v: u32 = range_part.parse().map_err(|_| CronError::InvalidField {
                field: name,
                raw: raw.to_string(),
                reason: format!("invalid value '{range_part}'"),
            })?;
            (v, v)
        };

        if lo < min || hi > max {
            return Err(CronError::InvalidField {
                field: name,
                raw: raw.to_string(),
                reason: format!("value out of range [{min},{max}]"),
            });
        }

        let mut v = lo;
        while v <= hi {
            values.insert(v);
            v += step;
        }
    }

    if values.is_empty() {
        return Err(CronError::InvalidField {
            field: name,
            raw: raw.to_string(),
            reason: "no values produced".to_string(),
        });
    }

    Ok(FieldSet { values, is_wildcard })
}

/// A parsed, validated cron expression: `minute hour day-of-month month day-of-week`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }
        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week: parse_field(fields[4], "day-of-week", 0, 6)?,
        })
    }

    fn day_matches(&self, date: &DateTime<Utc>) -> bool {
        let dom = date.day();
        // chrono: Monday = 0 ... Sunday = 6; cron: Sunday = 0 ... Saturday = 6.
        let dow = (date.weekday().num_days_from_sunday()) as u32;

        let dom_restricted = !self.day_of_month.is_wildcard;
        let dow_restricted = !self.day_of_week.is_wildcard;

        match (dom_restricted, dow_restricted) {
            // Vixie-cron rule: when both day-of-month and day-of-week are
            // restricted, a day matches if it satisfies *either* (OR, not AND).
            (true, true) => self.day_of_month.values.contains(&dom) || self.day_of_week.values.contains(&dow),
            _ => self.day_of_month.values.contains(&dom) && self.day_of_week.values.contains(&dow),
        }
    }

    fn matches(&self, candidate: &DateTime<Utc>) -> bool {
        self.minute.values.contains(&candidate.minute())
            && self.hour.values.contains(&candidate.hour())
            && self.month.values.contains(&candidate.month())
            && self.day_matches(candidate)
    }
}

/// One calendar year of minute-granularity search before giving up — bounds
/// the scan for an expression whose allowed set can never co-occur (e.g.
/// `31 2 30 2 *`, February 30th never exists).
const SEARCH_LIMIT: Duration = Duration::days(366);

/// The next UTC minute-boundary strictly greater than `from` that satisfies
/// `cron`, or `None` if no occurrence is found within the search horizon
/// (treated by [`super::IsDue`] callers as "never due").
pub fn next_occurrence(cron: &CronSchedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut candidate = truncate_to_minute(from) + Duration::minutes(1);
    let deadline = from + SEARCH_LIMIT;

    while candidate <= deadline {
        if cron.matches(&candidate) {
            return Some(candidate);
        }
        candidate += Duration::minutes(1);
    }
    None
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0).single().expect("valid truncation")
}

/// `true` iff `lastRun` is `None` and the first occurrence from the epoch is
/// due, or the next occurrence after `lastRun` is at or before `now`.
pub fn is_due(cron: &CronSchedule, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let anchor = last_run.unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch is valid"));
    match next_occurrence(cron, anchor) {
        Some(next) => next <= now,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(matches!(CronSchedule::parse("* * *"), Err(CronError::WrongFieldCount(3))));
    }

    #[test]
    fn rejects_out_of_range_value() {
        let err = CronSchedule::parse("60 * * * *").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CronInvalid);
    }

    #[test]
    fn every_minute_next_occurrence_is_one_minute_later() {
        let cron = CronSchedule::parse("* * * * *").unwrap();
        let from = dt(2026, 1, 1, 10, 30);
        assert_eq!(next_occurrence(&cron, from), Some(dt(2026, 1, 1, 10, 31)));
    }

    #[test]
    fn weekday_9am_rolls_forward_over_weekend() {
        // spec §8 scenario 6: Friday 09:00 -> Friday 17:00 should roll to Monday 09:00.
        let cron = CronSchedule::parse("0 9 * * 1-5").unwrap();
        let last_run = dt(2026, 1, 2, 9, 0); // Friday
        let now = dt(2026, 1, 2, 17, 0);
        assert!(!is_due(&cron, Some(last_run), now));
        let next = next_occurrence(&cron, last_run).unwrap();
        assert_eq!(next, dt(2026, 1, 5, 9, 0)); // Monday
    }

    #[test]
    fn strictly_monotonic_occurrences() {
        let cron = CronSchedule::parse("*/15 * * * *").unwrap();
        let from = dt(2026, 3, 1, 0, 0);
        let first = next_occurrence(&cron, from).unwrap();
        let second = next_occurrence(&cron, first).unwrap();
        assert!(second > first);
    }

    #[test]
    fn no_last_run_uses_epoch_anchor() {
        let cron = CronSchedule::parse("0 0 1 1 *").unwrap();
        let now = dt(2026, 6, 1, 0, 0);
        assert!(is_due(&cron, None, now));
    }

    #[test]
    fn dom_or_dow_when_both_restricted() {
        // 15th of the month OR a Monday.
        let cron = CronSchedule::parse("0 0 15 * 1").unwrap();
        // Jan 5, 2026 is a Monday, not the 15th -> still matches via dow.
        assert!(cron.matches(&dt(2026, 1, 5, 0, 0)));
        // Jan 15, 2026 is a Thursday, not a Monday -> still matches via dom.
        assert!(cron.matches(&dt(2026, 1, 15, 0, 0)));
    }

    #[test]
    fn impossible_date_returns_none() {
        let cron = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(next_occurrence(&cron, dt(2026, 1, 1, 0, 0)), None);
    }
}
