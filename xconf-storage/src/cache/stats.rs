//! Cache statistics.
//!
//! Counters are atomics bumped on the hot path; [`CacheStats`] is computed on
//! demand from a counter snapshot plus the live cache contents.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Live counters of one loading cache.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    load_success: AtomicU64,
    load_failure: AtomicU64,
    total_load_nanos: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load(&self, elapsed: Duration, success: bool) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_load_nanos.fetch_add(nanos, Ordering::Relaxed);
        if success {
            self.load_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.load_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            load_success: self.load_success.load(Ordering::Relaxed),
            load_failure: self.load_failure.load(Ordering::Relaxed),
            total_load_nanos: self.total_load_nanos.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub load_success: u64,
    pub load_failure: u64,
    pub total_load_nanos: u64,
    pub evictions: u64,
}

/// Statistics of one table cache, as reported to operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub table: String,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub size: usize,
    pub request_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_count: u64,
    /// Entries holding a value, counted by scanning the cache.
    pub non_absent_count: usize,
    pub load_success_count: u64,
    pub load_failure_count: u64,
    /// Total time spent in the loader, in milliseconds.
    pub total_load_time_ms: u64,
}

impl CacheStats {
    pub fn from_snapshot(
        table: impl Into<String>,
        snapshot: CounterSnapshot,
        size: usize,
        non_absent_count: usize,
        last_refreshed: Option<DateTime<Utc>>,
    ) -> Self {
        let requests = snapshot.hits + snapshot.misses;
        let (hit_rate, miss_rate) = if requests == 0 {
            (1.0, 0.0)
        } else {
            (
                snapshot.hits as f64 / requests as f64,
                snapshot.misses as f64 / requests as f64,
            )
        };
        Self {
            table: table.into(),
            last_refreshed,
            size,
            request_count: requests,
            hit_count: snapshot.hits,
            miss_count: snapshot.misses,
            hit_rate,
            miss_rate,
            eviction_count: snapshot.evictions,
            non_absent_count,
            load_success_count: snapshot.load_success,
            load_failure_count: snapshot.load_failure,
            total_load_time_ms: snapshot.total_load_nanos / 1_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let counters = CacheCounters::default();
        for _ in 0..8 {
            counters.record_hit();
        }
        counters.record_miss();
        counters.record_miss();

        let stats = CacheStats::from_snapshot("Model", counters.snapshot(), 3, 3, None);
        assert_eq!(stats.request_count, 10);
        assert!((stats.hit_rate - 0.8).abs() < 0.001);
        assert!((stats.miss_rate - 0.2).abs() < 0.001);
    }

    #[test]
    fn test_empty_cache_rates() {
        let stats = CacheStats::from_snapshot("Model", CounterSnapshot::default(), 0, 0, None);
        assert!((stats.hit_rate - 1.0).abs() < 0.001);
        assert!((stats.miss_rate - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_load_accounting() {
        let counters = CacheCounters::default();
        counters.record_load(Duration::from_millis(5), true);
        counters.record_load(Duration::from_millis(7), false);
        counters.record_evictions(2);

        let stats = CacheStats::from_snapshot("Model", counters.snapshot(), 0, 0, None);
        assert_eq!(stats.load_success_count, 1);
        assert_eq!(stats.load_failure_count, 1);
        assert_eq!(stats.total_load_time_ms, 12);
        assert_eq!(stats.eviction_count, 2);
    }

    #[test]
    fn test_serializes_camel_case() {
        let stats = CacheStats::from_snapshot("Model", CounterSnapshot::default(), 1, 1, None);
        let value = serde_json::to_value(&stats).unwrap();
        assert!(value.get("hitRate").is_some());
        assert!(value.get("nonAbsentCount").is_some());
    }
}
