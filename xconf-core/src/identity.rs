//! Time-ordered identifiers and clock helpers.
//!
//! Change-log rows are keyed by UUIDv7 strings. The canonical hyphenated
//! lowercase form of a UUIDv7 sorts lexicographically in creation order, so
//! the backing store can range-scan a bucket by plain string comparison.

use chrono::Utc;
use uuid::{Builder, Uuid};

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Generate a new time-ordered unique id.
pub fn time_ordered_id() -> String {
    Uuid::now_v7().to_string()
}

/// Smallest time-ordered id that can be generated at `ts_ms`.
///
/// Every id produced by [`time_ordered_id`] during that millisecond or later
/// compares greater than or equal to the returned value.
pub fn min_time_ordered_id(ts_ms: TimestampMs) -> String {
    let millis = ts_ms.max(0) as u64;
    Builder::from_unix_timestamp_millis(millis, &[0u8; 10])
        .into_uuid()
        .to_string()
}

/// Extract the embedded millisecond timestamp of a time-ordered id.
pub fn timestamp_of(id: &str) -> Option<TimestampMs> {
    let uuid = Uuid::parse_str(id).ok()?;
    let (secs, nanos) = uuid.get_timestamp()?.to_unix();
    Some(secs as i64 * 1000 + (nanos / 1_000_000) as i64)
}
