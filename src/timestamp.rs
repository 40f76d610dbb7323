//! Timestamp encoding shared by the sink, the feed and history rows
//!
//! Feed timestamps and history row timestamps are RFC 3339 strings; the sink and
//! the query service carry epoch milliseconds.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct TimestampError(pub String);

impl std::fmt::Display for TimestampError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid timestamp: {}", self.0)
    }
}

impl std::error::Error for TimestampError {}

/// Format epoch milliseconds as an RFC 3339 UTC string with millisecond precision.
pub fn encode_millis(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}

/// Parse a timestamp into epoch milliseconds.
///
/// Accepts plain epoch milliseconds, RFC 3339 with an offset, or a naive
/// `YYYY-MM-DDTHH:MM:SS[.fff]` which is read as UTC.
pub fn decode_millis(input: &str) -> Result<i64, TimestampError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TimestampError("empty timestamp".to_string()));
    }

    let digits = input.strip_prefix('-').unwrap_or(input);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return input
            .parse::<i64>()
            .map_err(|e| TimestampError(format!("{}: {}", input, e)));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp_millis());
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }

    Err(TimestampError(input.to_string()))
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
