//! Xconf Storage
//!
//! Table DAOs over a byte-oriented backing store, per-table loading caches
//! and the changed-keys protocol that keeps the caches of many service
//! instances consistent without direct communication.
//!
//! ```text
//! CachedSimpleDao / CachedListingDao
//!        │ write-through            ▲ read-through
//!        ▼                          │
//!  SimpleDao / ListingDao / CompressingDataDao ──► DatabaseClient
//!        │
//!        └─► AuditLogWriter ──► changed-keys table ◄── CacheRefreshTask
//! ```

pub mod cache;
pub mod client;
pub mod dao;
pub mod registry;

pub use cache::{
    ApplicationCache, CacheManager, CacheStats, CachedListingDao, CachedSimpleDao, LoadingCache,
};
pub use client::{DatabaseClient, InMemoryDatabaseClient, RowCells};
pub use dao::{CompressingDataDao, ListingDao, SimpleDao};
pub use registry::{CachedObject, Constructor, TableInfo, TableRegistry, XconfEntity};
