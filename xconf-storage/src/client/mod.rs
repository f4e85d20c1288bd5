//! Backing-store capability consumed by the DAO and cache layers.
//!
//! The store is byte-oriented: every value is an opaque payload already
//! serialized by a DAO, written with a TTL in seconds (0 = never expires).
//! Three families of operations exist:
//!
//! - single-key tables: one value per key
//! - two-key (listing) tables: a row per primary key holding cells ordered by
//!   secondary key, scannable by range
//! - compressed rows: a batch of named cells written and read together

pub mod memory;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use xconf_core::{RangeInfo, TwoKeys, XconfResult};

pub use memory::InMemoryDatabaseClient;

/// Cells of one row, keyed by secondary key.
pub type RowCells = BTreeMap<String, Vec<u8>>;

/// Key/value and two-key listing store with TTL and batch operations.
///
/// Single-record reads fail with `StorageError::NotFound` when the record is
/// absent; bulk reads return whatever exists.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// True for in-process stand-ins used by tests and local tooling.
    ///
    /// The cache manager skips precaching and the background refresh task
    /// when running against a test client.
    fn is_test_client(&self) -> bool {
        false
    }

    // ========================================================================
    // SINGLE-KEY OPERATIONS
    // ========================================================================

    async fn set_one(&self, table: &str, key: &str, value: Vec<u8>, ttl_secs: u32)
        -> XconfResult<()>;

    async fn get_one(&self, table: &str, key: &str) -> XconfResult<Vec<u8>>;

    /// Values for the requested keys that exist, in request order.
    async fn get_all_by_keys(
        &self,
        table: &str,
        keys: &[String],
    ) -> XconfResult<Vec<(String, Vec<u8>)>>;

    async fn get_all_keys(&self, table: &str) -> XconfResult<Vec<String>>;

    /// Up to `max_results` values in key order (0 = unlimited).
    async fn get_all_as_list(&self, table: &str, max_results: usize) -> XconfResult<Vec<Vec<u8>>>;

    async fn get_all_as_map(&self, table: &str) -> XconfResult<HashMap<String, Vec<u8>>>;

    async fn delete_one(&self, table: &str, key: &str) -> XconfResult<()>;

    /// Row-wide delete: removes the single-key value and every two-key cell
    /// stored under `key`.
    async fn delete_all(&self, table: &str, key: &str) -> XconfResult<()>;

    // ========================================================================
    // TWO-KEY (LISTING) OPERATIONS
    // ========================================================================

    async fn set_two_keys(
        &self,
        table: &str,
        key: &str,
        key2: &str,
        value: Vec<u8>,
        ttl_secs: u32,
    ) -> XconfResult<()>;

    async fn get_two_keys(&self, table: &str, key: &str, key2: &str) -> XconfResult<Vec<u8>>;

    async fn delete_two_keys(&self, table: &str, key: &str, key2: &str) -> XconfResult<()>;

    /// Prefix scan: every cell of the row, ordered by secondary key.
    async fn get_all(&self, table: &str, key: &str) -> XconfResult<Vec<(String, Vec<u8>)>>;

    /// Cells of the row whose secondary key falls in `range`, ordered by secondary key.
    async fn get_all_two_keys_range(
        &self,
        table: &str,
        key: &str,
        range: &RangeInfo,
    ) -> XconfResult<Vec<(String, Vec<u8>)>>;

    async fn get_all_two_keys_as_map(
        &self,
        table: &str,
        key: &str,
        key2s: &[String],
    ) -> XconfResult<HashMap<String, Vec<u8>>>;

    async fn get_all_two_keys(&self, table: &str) -> XconfResult<Vec<TwoKeys>>;

    async fn get_all_key2s(&self, table: &str, key: &str) -> XconfResult<Vec<String>>;

    // ========================================================================
    // COMPRESSED-CHUNK OPERATIONS
    // ========================================================================

    /// Write a batch of cells into one row with a shared TTL.
    async fn set_compressed_data(
        &self,
        table: &str,
        key: &str,
        cells: Vec<(String, Vec<u8>)>,
        ttl_secs: u32,
    ) -> XconfResult<()>;

    /// Every cell of one row. NotFound when the row has no live cells.
    async fn get_compressed_data(&self, table: &str, key: &str) -> XconfResult<RowCells>;

    async fn get_all_compressed_data_as_map(
        &self,
        table: &str,
    ) -> XconfResult<HashMap<String, RowCells>>;
}
