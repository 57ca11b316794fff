//! Timestamp utilities
//!
//! All persisted timestamps are UTC. SQLite hands back `YYYY-MM-DD HH:MM:SS`
//! with no timezone marker, so parsing appends `Z` before comparison with
//! `now`. Mixing local time in here has caused real staleness-sweep bugs.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{Error, Result};

const SQLITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current UTC timestamp truncated to whole seconds, the precision the
/// store keeps, so values written and re-read compare equal.
pub fn now_seconds() -> DateTime<Utc> {
    use chrono::{DurationRound, Duration};
    Utc::now()
        .duration_trunc(Duration::seconds(1))
        .expect("second truncation never overflows")
}

/// Format a timestamp the way it is stored in SQLite (second precision, UTC)
pub fn format_sqlite(ts: &DateTime<Utc>) -> String {
    ts.format(SQLITE_FORMAT).to_string()
}

/// Parse a timestamp column coming back from SQLite.
///
/// Accepts both the bare `YYYY-MM-DD HH:MM:SS` form (interpreted as UTC) and
/// RFC 3339 strings, so rows written by either `CURRENT_TIMESTAMP` or
/// application code round-trip.
pub fn parse_sqlite_utc(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, SQLITE_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("unparseable timestamp {:?}: {}", s, e)))
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sqlite_roundtrip_is_utc() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let s = format_sqlite(&ts);
        assert_eq!(s, "2025-03-14 09:26:53");
        assert_eq!(parse_sqlite_utc(&s).unwrap(), ts);
    }

    #[test]
    fn rfc3339_is_accepted() {
        let parsed = parse_sqlite_utc("2025-03-14T09:26:53+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 3, 14, 7, 26, 53).unwrap());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_sqlite_utc("not a timestamp").is_err());
    }
}
