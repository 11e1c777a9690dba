//! Event timestamp resolution.
//!
//! Shippers send timestamps as epoch numbers in four magnitudes or as
//! strings in a handful of formats. Anything unparseable falls back to the
//! ingest wall clock; the pipeline must never reject an event over its
//! timestamp.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};

/// Field aliases checked in order.
pub const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "time", "@timestamp"];

/// Interpret an epoch number by magnitude. Values at or above each
/// threshold take the larger unit: 1e12 -> milliseconds, 1e15 ->
/// microseconds, 1e18 -> nanoseconds.
pub fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }

    if value >= 1e18 {
        Utc.timestamp_opt((value / 1e9) as i64, (value % 1e9) as u32).single()
    } else if value >= 1e15 {
        let micros = value as i64;
        Utc.timestamp_opt(micros / 1_000_000, ((micros % 1_000_000) * 1000) as u32).single()
    } else if value >= 1e12 {
        let millis = value as i64;
        Utc.timestamp_millis_opt(millis).single()
    } else {
        let secs = value as i64;
        let nanos = ((value - secs as f64) * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }
}

/// Parse a timestamp string. Tries RFC 3339 first, then the common
/// database/syslog formats.
pub fn from_string(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Bare numbers arrive as strings from some shippers.
    if let Ok(value) = trimmed.parse::<f64>() {
        return from_epoch(value);
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }

    if let Ok(ts) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }

    // Offset-carrying formats without the T separator
    for fmt in ["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S %z"] {
        if let Ok(ts) = DateTime::parse_from_str(trimmed, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    // Naive formats, assumed UTC
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    // Classic syslog header without a year ("Jan  2 15:04:05")
    let with_year = format!("{} {}", Utc::now().year(), collapse_spaces(trimmed));
    if let Ok(naive) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }

    None
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve the event timestamp from the raw entry, falling back to `now`.
pub fn resolve(map: &serde_json::Map<String, serde_json::Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    for field in TIMESTAMP_FIELDS {
        match map.get(*field) {
            Some(serde_json::Value::Number(n)) => {
                if let Some(ts) = n.as_f64().and_then(from_epoch) {
                    return ts;
                }
            },
            Some(serde_json::Value::String(s)) => {
                if let Some(ts) = from_string(s) {
                    return ts;
                }
            },
            _ => {},
        }
    }
    now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_magnitude_units() {
        // Seconds
        let ts = from_epoch(1_700_000_000.0).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);

        // At 1e12 the value is taken as milliseconds
        let ts = from_epoch(1e12).unwrap();
        assert_eq!(ts.timestamp(), 1_000_000_000);

        // At 1e15 the value is taken as microseconds
        let ts = from_epoch(1e15).unwrap();
        assert_eq!(ts.timestamp(), 1_000_000_000);

        // At 1e18 the value is taken as nanoseconds
        let ts = from_epoch(1e18).unwrap();
        assert_eq!(ts.timestamp(), 1_000_000_000);

        // Just below the threshold the smaller unit wins
        let ts = from_epoch(1e12 - 1.0).unwrap();
        assert!(ts.timestamp() > 30_000_000_000);
    }

    #[test]
    fn test_string_formats() {
        assert!(from_string("2024-06-01T12:00:00Z").is_some());
        assert!(from_string("2024-06-01 12:00:00.123").is_some());
        assert!(from_string("2024-06-01 12:00:00 +0200").is_some());
        assert!(from_string("1700000000").is_some());
        assert!(from_string("not a time").is_none());
        assert!(from_string("").is_none());
    }

    #[test]
    fn test_resolve_falls_back_to_now() {
        let now = Utc::now();
        let mut map = serde_json::Map::new();
        map.insert("timestamp".to_string(), serde_json::json!("garbage"));
        assert_eq!(resolve(&map, now), now);
    }
}
