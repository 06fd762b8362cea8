//! Timestamp literals accepted at the boundary.
//!
//! Everything inside the engine is Unix milliseconds. Clients may send
//! integer milliseconds, RFC 3339 strings, or the naive forms the booking
//! form produces (`2025-01-15T10:00`, `2025-01-15`), which are read as UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::model::Ms;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub fn parse_timestamp(input: &str) -> Option<Ms> {
    let s = input.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// RFC 3339 rendering for logs.
pub fn format_ms(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
