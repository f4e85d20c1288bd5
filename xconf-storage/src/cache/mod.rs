//! Caching layer: per-table loading caches, the application cache, the
//! changed-keys audit log and the cross-instance refresh task.

pub mod application;
pub mod audit;
pub mod cached_dao;
pub mod loading;
pub mod manager;
pub mod refresh_task;
pub mod stats;

pub use application::ApplicationCache;
pub use audit::{AuditLogMetrics, AuditLogSnapshot, AuditLogWriter};
pub use cached_dao::{CachedListingDao, CachedSimpleDao};
pub use loading::{CacheLoader, LoadingCache};
pub use manager::{CacheInfo, CacheManager};
pub use refresh_task::{
    CacheRefreshMetrics, CacheRefreshSnapshot, CacheRefreshTask, CacheSynchronizer, RefreshState,
    TickOutcome,
};
pub use stats::{CacheCounters, CacheStats, CounterSnapshot};
