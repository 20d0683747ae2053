#![forbid(unsafe_code)]

//! Date handling.
//!
//! Queue entries carry ISO datetime strings whose first ten characters are a
//! `YYYY-MM-DD` day; lexicographic comparison on days is chronological, which
//! is what the queue filter relies on. Start dates must therefore be exactly
//! ten characters: a full ISO datetime would silently exclude same-day
//! entries via prefix comparison.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

const DAY_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateError {
    pub input: String,
}

impl std::fmt::Display for DateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid date '{}': expected YYYY-MM-DD",
            self.input
        )
    }
}

impl std::error::Error for DateError {}

/// Validate a strict `YYYY-MM-DD` day string and return it parsed.
///
/// Rejects anything that is not exactly a ten-character calendar day,
/// including full ISO datetimes.
pub fn parse_day(s: &str) -> Result<Date, DateError> {
    if s.len() != 10 {
        return Err(DateError {
            input: s.to_string(),
        });
    }
    Date::parse(s, DAY_FORMAT).map_err(|_| DateError {
        input: s.to_string(),
    })
}

/// First ten characters of a date string — the day used for ordering and
/// filtering. Shorter strings are returned unchanged.
pub fn day_of(date: &str) -> &str {
    if date.len() >= 10 { &date[..10] } else { date }
}

/// Lenient parse of queue/artifact dates: RFC 3339 (with `Z` accepted) or a
/// bare `YYYY-MM-DD` prefix. Returns UTC.
pub fn parse_datetime(s: &str) -> Option<OffsetDateTime> {
    let normalized = s.replace('Z', "+00:00");
    if let Ok(dt) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Some(dt.to_offset(time::UtcOffset::UTC));
    }
    // Datetime without offset, e.g. "2026-01-05T14:00:00".
    const NAIVE: &[time::format_description::BorrowedFormatItem<'static>] =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    if let Ok(dt) = PrimitiveDateTime::parse(&normalized, NAIVE) {
        return Some(dt.assume_utc());
    }
    let day = parse_day(day_of(s)).ok()?;
    Some(day.midnight().assume_utc())
}

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Current UTC time as an RFC 3339 string, second precision.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Format a unix timestamp (seconds) as UTC, or `None` when out of range.
pub fn from_unix_seconds(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

/// Format an `OffsetDateTime` as a `YYYY-MM-DD` day string.
pub fn format_day(dt: OffsetDateTime) -> String {
    dt.date()
        .format(DAY_FORMAT)
        .unwrap_or_else(|_| String::from("1970-01-01"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_day_accepts_calendar_days() {
        assert!(parse_day("2026-01-15").is_ok());
        assert!(parse_day("2025-12-01").is_ok());
    }

    #[test]
    fn parse_day_rejects_datetimes_and_garbage() {
        assert!(parse_day("2026-01-15T00:00:00+00:00").is_err());
        assert!(parse_day("2026-1-5").is_err());
        assert!(parse_day("2026-13-40").is_err());
        assert!(parse_day("not-a-date").is_err());
    }

    #[test]
    fn parse_datetime_handles_z_suffix_and_bare_days() {
        let a = parse_datetime("2026-01-15T12:30:00Z").expect("rfc3339");
        assert_eq!(a.date().to_string(), "2026-01-15");
        let b = parse_datetime("2026-01-15").expect("bare day");
        assert_eq!(b.date().to_string(), "2026-01-15");
        assert!(parse_datetime("garbage").is_none());
    }

    #[test]
    fn day_of_truncates_datetimes() {
        assert_eq!(day_of("2026-01-15T12:30:00+00:00"), "2026-01-15");
        assert_eq!(day_of("2026-01"), "2026-01");
    }
}
