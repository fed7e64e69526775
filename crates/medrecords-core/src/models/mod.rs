//! Domain models for the medrecords store.

mod appointment;
mod outbox;
mod patient;

pub use appointment::*;
pub use outbox::*;
pub use patient::*;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

/// A field failed validation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Format a timestamp the way the store persists it (UTC, milliseconds).
///
/// The fixed width keeps lexicographic and chronological order identical.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Current time in the persisted format.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_sortable() {
        let a = format_timestamp(Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap());
        let b = format_timestamp(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        assert_eq!(a, "2024-01-09T23:59:59.000Z");
        assert!(a < b);
    }

    #[test]
    fn test_parse_normalizes_offset() {
        let ts = parse_timestamp("2024-01-10T02:00:00+02:00").unwrap();
        assert_eq!(format_timestamp(ts), "2024-01-10T00:00:00.000Z");
        assert!(parse_timestamp("yesterday").is_none());
    }
}
