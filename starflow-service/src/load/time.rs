// Time-derived attributes
// Calendar parts of an event timestamp for the time dimension

use crate::record::Value;

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Calendar attribute derived from a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePart {
    /// The timestamp itself
    Timestamp,
    Hour,
    /// Day of month
    Day,
    /// ISO-8601 week number
    Week,
    Month,
    Year,
    /// Day of week, Monday = 0
    Weekday,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("epoch value {0} is out of range")]
    OutOfRange(String),

    #[error("cannot parse '{0}' as a timestamp")]
    Unparseable(String),

    #[error("cannot derive a timestamp from {0}")]
    UnsupportedType(String),
}

const TEXT_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Interpret a value as a UTC timestamp
///
/// Integers are epoch milliseconds, floats epoch seconds with a fraction;
/// text may be RFC 3339, `%Y-%m-%d %H:%M:%S` with optional fraction, or
/// an integer in milliseconds.
pub fn parse_timestamp(value: &Value) -> Result<NaiveDateTime, TimeError> {
    match value {
        Value::Timestamp(ts) => Ok(*ts),
        Value::Int(ms) => from_millis(*ms),
        Value::Float(secs) => {
            let ms = (secs * 1000.0).round();
            if !ms.is_finite() || ms.abs() > i64::MAX as f64 {
                return Err(TimeError::OutOfRange(secs.to_string()));
            }
            from_millis(ms as i64)
        }
        Value::Text(text) => parse_text(text.trim()),
        other => Err(TimeError::UnsupportedType(other.to_string())),
    }
}

fn from_millis(ms: i64) -> Result<NaiveDateTime, TimeError> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| TimeError::OutOfRange(ms.to_string()))
}

fn parse_text(text: &str) -> Result<NaiveDateTime, TimeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.naive_utc());
    }
    for format in TEXT_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(ts);
        }
    }
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(ms) = text.parse::<i64>() {
            return from_millis(ms);
        }
    }
    Err(TimeError::Unparseable(text.to_string()))
}

/// Derive a calendar part from a value; null stays null
pub fn derive(value: &Value, part: TimePart) -> Result<Value, TimeError> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    let ts = parse_timestamp(value)?;
    Ok(match part {
        TimePart::Timestamp => Value::Timestamp(ts),
        TimePart::Hour => Value::Int(i64::from(ts.hour())),
        TimePart::Day => Value::Int(i64::from(ts.day())),
        TimePart::Week => Value::Int(i64::from(ts.iso_week().week())),
        TimePart::Month => Value::Int(i64::from(ts.month())),
        TimePart::Year => Value::Int(i64::from(ts.year())),
        TimePart::Weekday => Value::Int(i64::from(ts.weekday().num_days_from_monday())),
    })
}
