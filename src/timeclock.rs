//! Worked-time primitives over stored text timestamps.
//!
//! Shift rows store start/end as RFC3339 TEXT (the same representation the
//! rest of the local store uses). Attendance math must never take a run
//! down: missing or unparsable timestamps contribute zero minutes, and a
//! clock-out before clock-in clamps to zero rather than going negative.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Parse a stored timestamp. Accepts RFC3339 (the canonical form), the
/// naive `YYYY-MM-DDTHH:MM:SS` shape older rows carry, and bare
/// `YYYY-MM-DD` dates (period bounds, effective-from markers) taken as
/// midnight UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Whole minutes between two stored timestamps, rounded, clamped at zero.
///
/// `None`, empty, or unparsable inputs yield 0 — a shift that was never
/// clocked out earns nothing instead of poisoning the whole run.
pub fn minutes_between(start: Option<&str>, end: Option<&str>) -> i64 {
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) => (s, e),
        _ => return 0,
    };
    let (start, end) = match (parse_timestamp(start), parse_timestamp(end)) {
        (Some(s), Some(e)) => (s, e),
        _ => return 0,
    };
    let seconds = (end - start).num_seconds();
    if seconds <= 0 {
        return 0;
    }
    ((seconds as f64) / 60.0).round() as i64
}

/// Minutes as display hours, rounded to 2 decimals.
pub fn to_hours(minutes: i64) -> f64 {
    crate::money::round2(minutes as f64 / 60.0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minutes_between_normal_shift() {
        let m = minutes_between(
            Some("2025-03-01T08:00:00Z"),
            Some("2025-03-01T16:00:00Z"),
        );
        assert_eq!(m, 480);
    }

    #[test]
    fn test_minutes_between_rounds_seconds() {
        // 90 seconds rounds to 2 minutes, 89 seconds to 1
        assert_eq!(
            minutes_between(Some("2025-03-01T08:00:00Z"), Some("2025-03-01T08:01:30Z")),
            2
        );
        assert_eq!(
            minutes_between(Some("2025-03-01T08:00:00Z"), Some("2025-03-01T08:01:29Z")),
            1
        );
    }

    #[test]
    fn test_minutes_between_end_before_start_is_zero() {
        let m = minutes_between(
            Some("2025-03-01T16:00:00Z"),
            Some("2025-03-01T08:00:00Z"),
        );
        assert_eq!(m, 0);
    }

    #[test]
    fn test_minutes_between_equal_is_zero() {
        let m = minutes_between(
            Some("2025-03-01T08:00:00Z"),
            Some("2025-03-01T08:00:00Z"),
        );
        assert_eq!(m, 0);
    }

    #[test]
    fn test_minutes_between_missing_or_garbage_is_zero() {
        assert_eq!(minutes_between(None, Some("2025-03-01T08:00:00Z")), 0);
        assert_eq!(minutes_between(Some("2025-03-01T08:00:00Z"), None), 0);
        assert_eq!(minutes_between(None, None), 0);
        assert_eq!(
            minutes_between(Some("not a date"), Some("2025-03-01T08:00:00Z")),
            0
        );
    }

    #[test]
    fn test_minutes_between_accepts_naive_form() {
        let m = minutes_between(
            Some("2025-03-01T08:00:00"),
            Some("2025-03-01T12:30:00"),
        );
        assert_eq!(m, 270);
    }

    #[test]
    fn test_minutes_between_mixed_offsets() {
        // +08:00 start against a UTC end, same instant span of 1h
        let m = minutes_between(
            Some("2025-03-01T16:00:00+08:00"),
            Some("2025-03-01T09:00:00Z"),
        );
        assert_eq!(m, 60);
    }

    #[test]
    fn test_to_hours_two_decimals() {
        assert_eq!(to_hours(480), 8.0);
        assert_eq!(to_hours(500), 8.33);
        assert_eq!(to_hours(0), 0.0);
    }
}
