//! Operator types and the fixed comparison semantics behind `Trait` and
//! `Performed` nodes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Operator applied to a trait value. Semantics are fixed per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentOperator {
    Equals { value: serde_json::Value },
    NotEquals { value: serde_json::Value },
    Exists,
    NotExists,
    /// Trait is a timestamp within `window_seconds` before the snapshot time.
    Within { window_seconds: u64 },
    /// Inclusive numeric range.
    Between { min: f64, max: f64 },
    GreaterThan { value: f64 },
    LessThan { value: f64 },
}

/// Comparison used for event counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    #[default]
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

/// Applies `operator` to an attribute that may be absent. Absent attributes
/// only ever satisfy `NotExists`.
pub fn apply_operator(
    actual: Option<&serde_json::Value>,
    operator: &SegmentOperator,
    as_of: DateTime<Utc>,
) -> bool {
    let present = actual.filter(|v| !v.is_null());
    match operator {
        SegmentOperator::Equals { value } => present.is_some_and(|a| values_equal(a, value)),
        SegmentOperator::NotEquals { value } => present.is_some_and(|a| !values_equal(a, value)),
        SegmentOperator::Exists => present.is_some(),
        SegmentOperator::NotExists => present.is_none(),
        SegmentOperator::Within { window_seconds } => present
            .and_then(parse_timestamp)
            .is_some_and(|t| {
                let secs = i64::try_from(*window_seconds).unwrap_or(i64::MAX).min(i64::MAX / 1000);
                let window = Duration::seconds(secs);
                t <= as_of && as_of.signed_duration_since(t) <= window
            }),
        SegmentOperator::Between { min, max } => present
            .and_then(as_number)
            .is_some_and(|n| n >= *min && n <= *max),
        SegmentOperator::GreaterThan { value } => {
            present.and_then(as_number).is_some_and(|n| n > *value)
        }
        SegmentOperator::LessThan { value } => {
            present.and_then(as_number).is_some_and(|n| n < *value)
        }
    }
}

pub fn compare_numbers(actual: u64, operator: ComparisonOperator, expected: u64) -> bool {
    match operator {
        ComparisonOperator::Equals => actual == expected,
        ComparisonOperator::NotEquals => actual != expected,
        ComparisonOperator::GreaterThan => actual > expected,
        ComparisonOperator::GreaterThanOrEqual => actual >= expected,
        ComparisonOperator::LessThan => actual < expected,
        ComparisonOperator::LessThanOrEqual => actual <= expected,
    }
}

/// Exact match, except that numbers compare by value (`1` equals `1.0`).
fn values_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a, b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Numbers, and strings holding finite numbers, are numeric. `"NaN"` and
/// `"inf"` are not.
pub fn as_number(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// RFC 3339 strings and epoch milliseconds are timestamps.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}
