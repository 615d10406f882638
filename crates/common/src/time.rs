use chrono::{DateTime, NaiveDate, SecondsFormat, Timelike, Utc};

pub type Timestamp = DateTime<Utc>;

/// Parse a timestamp from any of the shapes the source and destination emit
/// (`2026-02-20T15:00:00.000Z`, `2026-02-20T15:00:00.000+0000`, `2026-02-20`)
/// and normalize it to UTC.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Canonical storage form: RFC 3339, millisecond precision, `Z` suffix.
///
/// Fixed width, so lexicographic order matches chronological order.
pub fn canonical(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Drop seconds and sub-second precision.
pub fn truncate_to_minute(ts: &Timestamp) -> Timestamp {
    ts.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(*ts)
}
