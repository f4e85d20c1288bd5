//! Changed-keys audit log model and time-bucket arithmetic.
//!
//! Every cache-backed write appends one [`ChangedData`] row to the shared
//! changed-keys table. Rows are partitioned by a fixed-width time bucket (the
//! primary key) and ordered inside a bucket by a time-ordered id (the
//! secondary key), so each instance can replay other instances' writes by
//! scanning the buckets it has not seen yet.

use serde::{Deserialize, Serialize};

use crate::identity::{min_time_ordered_id, time_ordered_id, TimestampMs};
use crate::keys::RangeInfo;
use crate::XconfResult;

/// Kind of mutation recorded in the changed-keys log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
    TruncateCf,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::TruncateCf => "TRUNCATE_CF",
        }
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the changed-keys audit log.
///
/// Fields are lenient on deserialization so that rows written by older
/// producers can be inspected and skipped individually via
/// [`ChangedData::missing_field`] instead of failing a whole bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedData {
    /// Time-ordered unique id; also the within-bucket sort key.
    #[serde(rename = "columnName", default)]
    pub column_name: String,
    /// Table the change applies to.
    #[serde(rename = "cfName", default)]
    pub cf_name: String,
    #[serde(rename = "changedKey", default)]
    pub changed_key: String,
    #[serde(default)]
    pub operation: Option<ChangeOperation>,
    #[serde(rename = "DAOid", default)]
    pub dao_id: Option<i32>,
    /// Cache size the writer observed after its own write.
    #[serde(rename = "validCacheSize", default)]
    pub valid_cache_size: usize,
    #[serde(rename = "userName", default)]
    pub user_name: String,
}

impl ChangedData {
    /// Build a new record with a fresh time-ordered id.
    pub fn new(
        cf_name: impl Into<String>,
        changed_key: impl Into<String>,
        operation: ChangeOperation,
        dao_id: i32,
        valid_cache_size: usize,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            column_name: time_ordered_id(),
            cf_name: cf_name.into(),
            changed_key: changed_key.into(),
            operation: Some(operation),
            dao_id: Some(dao_id),
            valid_cache_size,
            user_name: user_name.into(),
        }
    }

    /// Name of the first required field that is absent, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.column_name.is_empty() {
            Some("columnName")
        } else if self.cf_name.is_empty() {
            Some("cfName")
        } else if self.changed_key.is_empty() {
            Some("changedKey")
        } else if self.operation.is_none() {
            Some("operation")
        } else if self.dao_id.is_none() {
            Some("DAOid")
        } else {
            None
        }
    }

    /// Changed key with accidental doubled surrounding quotes removed.
    ///
    /// Legacy producers JSON-encoded the key twice, leaving `"\"key\""`.
    pub fn normalized_key(&self) -> &str {
        let key = self.changed_key.as_str();
        if key.len() >= 2 && key.starts_with('"') && key.ends_with('"') {
            &key[1..key.len() - 1]
        } else {
            key
        }
    }

    pub fn to_json(&self) -> XconfResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> XconfResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Start of the bucket containing `ts`.
///
/// `window_ms` must be positive; callers validate it at configuration time.
pub fn bucket_of(ts: TimestampMs, window_ms: i64) -> TimestampMs {
    ts - ts.rem_euclid(window_ms)
}

/// Ascending, gap-free, duplicate-free bucket keys covering `[start, end)`.
///
/// An empty interval yields no buckets.
pub fn bucket_keys(start: TimestampMs, end: TimestampMs, window_ms: i64) -> Vec<TimestampMs> {
    if end <= start || window_ms <= 0 {
        return Vec::new();
    }
    let mut keys = Vec::new();
    let mut bucket = bucket_of(start, window_ms);
    while bucket < end {
        keys.push(bucket);
        bucket += window_ms;
    }
    keys
}

/// Range of secondary keys to scan in each bucket of a sync window.
///
/// The first bucket is bounded below by the smallest id of `start`; every
/// later bucket is scanned whole.
pub fn bucket_ranges(
    start: TimestampMs,
    end: TimestampMs,
    window_ms: i64,
) -> Vec<(TimestampMs, RangeInfo)> {
    bucket_keys(start, end, window_ms)
        .into_iter()
        .enumerate()
        .map(|(i, bucket)| {
            let range = if i == 0 {
                RangeInfo::from_start(min_time_ordered_id(start))
            } else {
                RangeInfo::unbounded()
            };
            (bucket, range)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_operation_serialization() {
        let json = serde_json::to_string(&ChangeOperation::TruncateCf).unwrap();
        assert_eq!(json, "\"TRUNCATE_CF\"");
        let op: ChangeOperation = serde_json::from_str("\"UPDATE\"").unwrap();
        assert_eq!(op, ChangeOperation::Update);
    }

    #[test]
    fn test_changed_data_json_field_names() {
        let record = ChangedData::new("Model", "m1", ChangeOperation::Create, 7, 3, "node-a");
        let value: serde_json::Value = serde_json::from_slice(&record.to_json().unwrap()).unwrap();
        for field in [
            "columnName",
            "cfName",
            "changedKey",
            "operation",
            "DAOid",
            "validCacheSize",
            "userName",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(ChangedData::from_json(&record.to_json().unwrap()).unwrap(), record);
    }

    #[test]
    fn test_missing_field_detection() {
        let record: ChangedData =
            serde_json::from_str(r#"{"columnName":"x","cfName":"Model","operation":"DELETE","DAOid":1}"#)
                .unwrap();
        assert_eq!(record.missing_field(), Some("changedKey"));

        let complete = ChangedData::new("Model", "m1", ChangeOperation::Delete, 1, 0, "u");
        assert_eq!(complete.missing_field(), None);
    }

    #[test]
    fn test_normalized_key_strips_doubled_quotes() {
        let mut record = ChangedData::new("Model", "\"m1\"", ChangeOperation::Update, 1, 0, "u");
        assert_eq!(record.normalized_key(), "m1");
        record.changed_key = "m1".to_string();
        assert_eq!(record.normalized_key(), "m1");
        record.changed_key = "\"".to_string();
        assert_eq!(record.normalized_key(), "\"");
    }

    #[test]
    fn test_bucket_of() {
        assert_eq!(bucket_of(1_000, 300), 900);
        assert_eq!(bucket_of(900, 300), 900);
        assert_eq!(bucket_of(0, 300), 0);
    }

    #[test]
    fn test_bucket_keys_examples() {
        assert_eq!(bucket_keys(950, 1_250, 100), vec![900, 1_000, 1_100, 1_200]);
        assert_eq!(bucket_keys(1_000, 1_100, 100), vec![1_000]);
        assert!(bucket_keys(1_000, 1_000, 100).is_empty());
        assert!(bucket_keys(1_000, 900, 100).is_empty());
    }

    #[test]
    fn test_bucket_ranges_bound_only_first() {
        let ranges = bucket_ranges(950, 1_250, 100);
        assert_eq!(ranges.len(), 4);
        assert_eq!(
            ranges[0].1.start_value.as_deref(),
            Some(min_time_ordered_id(950).as_str())
        );
        assert!(ranges[1..].iter().all(|(_, r)| r.is_unbounded()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]

        /// Property: bucket keys cover [start, end) with no gaps and no duplicates.
        #[test]
        fn prop_bucket_coverage(
            start in 0i64..10_000_000,
            len in 1i64..5_000_000,
            window in 1i64..1_000_000,
        ) {
            let end = start + len;
            let keys = bucket_keys(start, end, window);

            prop_assert!(!keys.is_empty());
            prop_assert!(keys[0] <= start);
            prop_assert!(keys[0] + window > start);
            for pair in keys.windows(2) {
                prop_assert_eq!(pair[1] - pair[0], window);
            }
            let last = *keys.last().unwrap();
            prop_assert!(last < end);
            prop_assert!(last + window >= end);
            for ts in [start, end - 1, start + len / 2] {
                prop_assert!(keys.contains(&bucket_of(ts, window)));
            }
        }
    }
}
