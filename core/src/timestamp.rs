/// Timestamp normalization
///
/// Backends report message times under different field names and in
/// different shapes (RFC 3339 strings, naive local date-times, epoch numbers,
/// Jackson `LocalDateTime` arrays). Everything is folded into epoch
/// milliseconds here, once, at ingestion.
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Numbers below this are epoch seconds, above it epoch millis (year 5138 cutoff).
const SECONDS_CUTOFF: i64 = 100_000_000_000;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// A normalized message time.
///
/// `parsed == false` marks a best-effort value (ingestion time) used when no
/// strategy understood the raw input. Such values order messages but never
/// advance a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub millis: i64,
    pub parsed: bool,
}

impl Timestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self {
            millis,
            parsed: true,
        }
    }

    pub fn now() -> Self {
        Self::from_millis(now_millis())
    }

    fn fallback() -> Self {
        Self {
            millis: now_millis(),
            parsed: false,
        }
    }

    /// Millis usable for cursor comparisons, `None` for fallback values
    pub fn cursor_value(&self) -> Option<i64> {
        self.parsed.then_some(self.millis)
    }

    pub fn to_rfc3339(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.millis)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Time first; at equal millis a fallback value sorts before a parsed one
impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then(self.parsed.cmp(&other.parsed))
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Normalize the first present timestamp field. Never fails.
pub fn normalize_first(candidates: &[Option<&Value>]) -> Timestamp {
    candidates
        .iter()
        .flatten()
        .find(|v| !v.is_null())
        .map(|v| normalize(v))
        .unwrap_or_else(Timestamp::fallback)
}

/// Normalize one raw JSON value. Never fails.
pub fn normalize(value: &Value) -> Timestamp {
    let millis = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(epoch_to_millis),
        Value::String(s) => parse_str(s),
        Value::Array(parts) => parse_array(parts),
        _ => None,
    };
    millis.map(Timestamp::from_millis).unwrap_or_else(Timestamp::fallback)
}

/// Parse a timestamp string, `None` when no strategy matches
pub fn parse_str(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().map(epoch_to_millis);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn epoch_to_millis(n: i64) -> i64 {
    if n.abs() < SECONDS_CUTOFF {
        n.saturating_mul(1000)
    } else {
        n
    }
}

/// Jackson serializes `LocalDateTime` as `[y, m, d, h, mi, s?, nanos?]`
fn parse_array(parts: &[Value]) -> Option<i64> {
    if parts.len() < 3 {
        return None;
    }
    let field = |i: usize| -> Option<i64> {
        match parts.get(i) {
            Some(v) => v.as_i64(),
            None => Some(0),
        }
    };
    let date = NaiveDate::from_ymd_opt(
        i32::try_from(field(0)?).ok()?,
        u32::try_from(field(1)?).ok()?,
        u32::try_from(field(2)?).ok()?,
    )?;
    let dt = date.and_hms_nano_opt(
        u32::try_from(field(3)?).ok()?,
        u32::try_from(field(4)?).ok()?,
        u32::try_from(field(5)?).ok()?,
        u32::try_from(field(6)?).ok()?,
    )?;
    Some(dt.and_utc().timestamp_millis())
}
