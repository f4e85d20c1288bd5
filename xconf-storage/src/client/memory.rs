//! In-process database client.
//!
//! Backs unit and scenario tests, and lets several cache managers share one
//! store to exercise cross-instance synchronization. TTLs are honored lazily
//! on read. Operation counters and fault injection make the store observable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use xconf_core::{RangeInfo, StorageError, TwoKeys, XconfError, XconfResult};

use super::{DatabaseClient, RowCells};

#[derive(Debug, Clone)]
struct Cell {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl Cell {
    fn new(value: Vec<u8>, ttl_secs: u32) -> Self {
        let expires_at = if ttl_secs > 0 {
            Some(Utc::now() + ChronoDuration::seconds(ttl_secs as i64))
        } else {
            None
        };
        Self { value, expires_at }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

type Row = BTreeMap<String, Cell>;

#[derive(Debug, Default)]
struct Tables {
    /// table -> key -> value
    single: HashMap<String, BTreeMap<String, Cell>>,
    /// table -> key -> key2 -> value
    rows: HashMap<String, BTreeMap<String, Row>>,
}

impl Tables {
    fn live_row(&self, table: &str, key: &str, now: DateTime<Utc>) -> Vec<(String, Vec<u8>)> {
        self.rows
            .get(table)
            .and_then(|t| t.get(key))
            .map(|row| {
                row.iter()
                    .filter(|(_, cell)| cell.is_live(now))
                    .map(|(k2, cell)| (k2.clone(), cell.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shared in-memory store implementing [`DatabaseClient`].
#[derive(Debug, Default)]
pub struct InMemoryDatabaseClient {
    tables: RwLock<Tables>,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_all: AtomicBool,
    failing_tables: RwLock<HashSet<String>>,
}

impl InMemoryDatabaseClient {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read operations served since creation.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write operations (including deletes) served since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every operation fail with a backend error.
    pub fn set_fail_all(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Make every operation on one table fail with a backend error.
    pub fn set_table_failing(&self, table: &str, failing: bool) {
        if let Ok(mut tables) = self.failing_tables.write() {
            if failing {
                tables.insert(table.to_string());
            } else {
                tables.remove(table);
            }
        }
    }

    /// Number of live cells stored in one row of a two-key table.
    pub fn row_len(&self, table: &str, key: &str) -> usize {
        self.tables
            .read()
            .map(|t| t.live_row(table, key, Utc::now()).len())
            .unwrap_or(0)
    }

    fn check(&self, table: &str) -> XconfResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(XconfError::backend(table, "injected failure"));
        }
        let failing = self
            .failing_tables
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        if failing.contains(table) {
            return Err(XconfError::backend(table, "injected table failure"));
        }
        Ok(())
    }

    fn read(&self, table: &str) -> XconfResult<RwLockReadGuard<'_, Tables>> {
        self.check(table)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.tables.read().map_err(|_| StorageError::LockPoisoned)?)
    }

    fn write(&self, table: &str) -> XconfResult<RwLockWriteGuard<'_, Tables>> {
        self.check(table)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(self.tables.write().map_err(|_| StorageError::LockPoisoned)?)
    }
}

#[async_trait]
impl DatabaseClient for InMemoryDatabaseClient {
    fn is_test_client(&self) -> bool {
        true
    }

    async fn set_one(
        &self,
        table: &str,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u32,
    ) -> XconfResult<()> {
        let mut tables = self.write(table)?;
        tables
            .single
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), Cell::new(value, ttl_secs));
        Ok(())
    }

    async fn get_one(&self, table: &str, key: &str) -> XconfResult<Vec<u8>> {
        let tables = self.read(table)?;
        let now = Utc::now();
        tables
            .single
            .get(table)
            .and_then(|t| t.get(key))
            .filter(|cell| cell.is_live(now))
            .map(|cell| cell.value.clone())
            .ok_or_else(|| XconfError::not_found(table, key))
    }

    async fn get_all_by_keys(
        &self,
        table: &str,
        keys: &[String],
    ) -> XconfResult<Vec<(String, Vec<u8>)>> {
        let tables = self.read(table)?;
        let now = Utc::now();
        let Some(values) = tables.single.get(table) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| {
                values
                    .get(key)
                    .filter(|cell| cell.is_live(now))
                    .map(|cell| (key.clone(), cell.value.clone()))
            })
            .collect())
    }

    async fn get_all_keys(&self, table: &str) -> XconfResult<Vec<String>> {
        let tables = self.read(table)?;
        let now = Utc::now();
        Ok(tables
            .single
            .get(table)
            .map(|t| {
                t.iter()
                    .filter(|(_, cell)| cell.is_live(now))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_all_as_list(&self, table: &str, max_results: usize) -> XconfResult<Vec<Vec<u8>>> {
        let tables = self.read(table)?;
        let now = Utc::now();
        let limit = if max_results == 0 { usize::MAX } else { max_results };
        Ok(tables
            .single
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|cell| cell.is_live(now))
                    .take(limit)
                    .map(|cell| cell.value.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_all_as_map(&self, table: &str) -> XconfResult<HashMap<String, Vec<u8>>> {
        let tables = self.read(table)?;
        let now = Utc::now();
        Ok(tables
            .single
            .get(table)
            .map(|t| {
                t.iter()
                    .filter(|(_, cell)| cell.is_live(now))
                    .map(|(key, cell)| (key.clone(), cell.value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_one(&self, table: &str, key: &str) -> XconfResult<()> {
        let mut tables = self.write(table)?;
        if let Some(t) = tables.single.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn delete_all(&self, table: &str, key: &str) -> XconfResult<()> {
        let mut tables = self.write(table)?;
        if let Some(t) = tables.single.get_mut(table) {
            t.remove(key);
        }
        if let Some(t) = tables.rows.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn set_two_keys(
        &self,
        table: &str,
        key: &str,
        key2: &str,
        value: Vec<u8>,
        ttl_secs: u32,
    ) -> XconfResult<()> {
        let mut tables = self.write(table)?;
        tables
            .rows
            .entry(table.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(key2.to_string(), Cell::new(value, ttl_secs));
        Ok(())
    }

    async fn get_two_keys(&self, table: &str, key: &str, key2: &str) -> XconfResult<Vec<u8>> {
        let tables = self.read(table)?;
        let now = Utc::now();
        tables
            .rows
            .get(table)
            .and_then(|t| t.get(key))
            .and_then(|row| row.get(key2))
            .filter(|cell| cell.is_live(now))
            .map(|cell| cell.value.clone())
            .ok_or_else(|| XconfError::not_found(table, TwoKeys::new(key, key2).to_string()))
    }

    async fn delete_two_keys(&self, table: &str, key: &str, key2: &str) -> XconfResult<()> {
        let mut tables = self.write(table)?;
        if let Some(row) = tables.rows.get_mut(table).and_then(|t| t.get_mut(key)) {
            row.remove(key2);
        }
        Ok(())
    }

    async fn get_all(&self, table: &str, key: &str) -> XconfResult<Vec<(String, Vec<u8>)>> {
        let tables = self.read(table)?;
        Ok(tables.live_row(table, key, Utc::now()))
    }

    async fn get_all_two_keys_range(
        &self,
        table: &str,
        key: &str,
        range: &RangeInfo,
    ) -> XconfResult<Vec<(String, Vec<u8>)>> {
        let tables = self.read(table)?;
        Ok(tables
            .live_row(table, key, Utc::now())
            .into_iter()
            .filter(|(key2, _)| range.contains(key2))
            .collect())
    }

    async fn get_all_two_keys_as_map(
        &self,
        table: &str,
        key: &str,
        key2s: &[String],
    ) -> XconfResult<HashMap<String, Vec<u8>>> {
        let tables = self.read(table)?;
        let wanted: HashSet<&String> = key2s.iter().collect();
        Ok(tables
            .live_row(table, key, Utc::now())
            .into_iter()
            .filter(|(key2, _)| wanted.contains(key2))
            .collect())
    }

    async fn get_all_two_keys(&self, table: &str) -> XconfResult<Vec<TwoKeys>> {
        let tables = self.read(table)?;
        let now = Utc::now();
        Ok(tables
            .rows
            .get(table)
            .map(|t| {
                t.iter()
                    .flat_map(|(key, row)| {
                        row.iter()
                            .filter(move |(_, cell)| cell.is_live(now))
                            .map(move |(key2, _)| TwoKeys::new(key.clone(), key2.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_all_key2s(&self, table: &str, key: &str) -> XconfResult<Vec<String>> {
        let tables = self.read(table)?;
        Ok(tables
            .live_row(table, key, Utc::now())
            .into_iter()
            .map(|(key2, _)| key2)
            .collect())
    }

    async fn set_compressed_data(
        &self,
        table: &str,
        key: &str,
        cells: Vec<(String, Vec<u8>)>,
        ttl_secs: u32,
    ) -> XconfResult<()> {
        let mut tables = self.write(table)?;
        let row = tables
            .rows
            .entry(table.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default();
        for (key2, value) in cells {
            row.insert(key2, Cell::new(value, ttl_secs));
        }
        Ok(())
    }

    async fn get_compressed_data(&self, table: &str, key: &str) -> XconfResult<RowCells> {
        let tables = self.read(table)?;
        let cells: RowCells = tables
            .live_row(table, key, Utc::now())
            .into_iter()
            .collect();
        if cells.is_empty() {
            return Err(XconfError::not_found(table, key));
        }
        Ok(cells)
    }

    async fn get_all_compressed_data_as_map(
        &self,
        table: &str,
    ) -> XconfResult<HashMap<String, RowCells>> {
        let tables = self.read(table)?;
        let now = Utc::now();
        let Some(rows) = tables.rows.get(table) else {
            return Ok(HashMap::new());
        };
        Ok(rows
            .keys()
            .filter_map(|key| {
                let cells: RowCells = tables.live_row(table, key, now).into_iter().collect();
                (!cells.is_empty()).then(|| (key.clone(), cells))
            })
            .collect())
    }
}
