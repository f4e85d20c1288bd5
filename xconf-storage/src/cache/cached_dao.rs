//! Cache-backed DAOs.
//!
//! The read/write surface used by rule and configuration storage. Reads go
//! cache first and fall back to the table loader; writes go store first and,
//! only once the store accepted them, update the cache, invalidate the
//! table's application-cache entries and append a changed-keys record.
//! Tables registered without caching pass straight through to the store.
//!
//! With `cache_clone_data_enabled`, every returned value is a fresh copy;
//! otherwise callers share the cached instance and must not mutate it.

use std::collections::HashMap;
use std::sync::Arc;

use xconf_core::{ChangeOperation, CodecError, TwoKeys, XconfError, XconfResult};

use super::manager::CacheManager;
use crate::registry::{CachedObject, TableInfo, XconfEntity};

fn typed<T: XconfEntity>(
    manager: &CacheManager,
    table: &str,
    key: &str,
    obj: CachedObject,
) -> XconfResult<Arc<T>> {
    let value = obj.downcast::<T>().map_err(|_| CodecError::TypeMismatch {
        table: table.to_string(),
        key: key.to_string(),
        expected: std::any::type_name::<T>().to_string(),
    })?;
    if manager.settings().clone_data_enabled {
        Ok(Arc::new(T::clone(&value)))
    } else {
        Ok(value)
    }
}

fn sorted_values<T: XconfEntity>(
    manager: &CacheManager,
    table: &str,
    mut entries: Vec<(String, CachedObject)>,
) -> XconfResult<Vec<(String, Arc<T>)>> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
        .into_iter()
        .map(|(key, obj)| typed::<T>(manager, table, &key, obj).map(|value| (key, value)))
        .collect()
}

fn take_limit<T>(values: Vec<T>, max_results: usize) -> Vec<T> {
    if max_results == 0 {
        values
    } else {
        values.into_iter().take(max_results).collect()
    }
}

// ============================================================================
// SINGLE-KEY TABLES
// ============================================================================

/// Cache-backed DAO for single-key and compressed tables.
#[derive(Debug, Clone)]
pub struct CachedSimpleDao {
    manager: Arc<CacheManager>,
}

impl CachedSimpleDao {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }

    async fn load_uncached(&self, info: &TableInfo, key: &str) -> XconfResult<CachedObject> {
        if info.is_compress_and_split() {
            self.manager.compressing_dao().get_one(info, key).await
        } else {
            self.manager.simple_dao().get_one(info, key).await
        }
    }

    pub async fn get_one<T: XconfEntity>(&self, table: &str, key: &str) -> XconfResult<Arc<T>> {
        let info = self.manager.registry().get_table_info(table)?;
        let obj = match self.manager.table_cache(table) {
            Some(cache) => cache.get(key).await?,
            None => self.load_uncached(&info, key).await?,
        };
        typed(&self.manager, table, key, obj)
    }

    /// Cached value without ever calling the store.
    pub fn get_one_from_cache_only<T: XconfEntity>(&self, table: &str, key: &str) -> XconfResult<Arc<T>> {
        let obj = self
            .manager
            .cache(table)?
            .get_if_present(key)
            .ok_or_else(|| XconfError::not_found(table, key))?;
        typed(&self.manager, table, key, obj)
    }

    pub async fn set_one<T: XconfEntity>(&self, table: &str, key: &str, value: T) -> XconfResult<()> {
        let info = self.manager.registry().get_table_info(table)?;
        if info.is_compress_and_split() {
            self.manager
                .compressing_dao()
                .set_one(&info, key, &value)
                .await?;
        } else {
            self.manager.simple_dao().set_one(&info, key, &value).await?;
        }

        if let Some(cache) = self.manager.table_cache(table) {
            let operation = if cache.contains(key) {
                ChangeOperation::Update
            } else {
                ChangeOperation::Create
            };
            cache.put(key, Arc::new(value));
            self.manager.application_cache().delete_all(table);
            self.manager
                .write_cache_log(table, key, operation, cache.size());
        }
        Ok(())
    }

    pub async fn delete_one(&self, table: &str, key: &str) -> XconfResult<()> {
        let info = self.manager.registry().get_table_info(table)?;
        if info.is_compress_and_split() {
            self.manager.compressing_dao().delete_one(&info, key).await?;
        } else {
            self.manager.simple_dao().delete_one(&info, key).await?;
        }

        if let Some(cache) = self.manager.table_cache(table) {
            let size_after = cache.size().saturating_sub(1);
            cache.invalidate(key);
            self.manager.application_cache().delete_all(table);
            self.manager
                .write_cache_log(table, key, ChangeOperation::Delete, size_after);
        }
        Ok(())
    }

    /// Values of the existing keys among `keys`, in request order.
    pub async fn get_all_by_keys<T: XconfEntity>(
        &self,
        table: &str,
        keys: &[String],
    ) -> XconfResult<Vec<Arc<T>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_one::<T>(table, key).await {
                Ok(value) => values.push(value),
                Err(e) if e.is_not_found() && self.manager.registry().contains(table) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }

    /// Up to `max_results` values ordered by key (0 = unlimited).
    pub async fn get_all_as_list<T: XconfEntity>(
        &self,
        table: &str,
        max_results: usize,
    ) -> XconfResult<Vec<Arc<T>>> {
        let entries = self.all_entries(table).await?;
        let values = sorted_values::<T>(&self.manager, table, entries)?
            .into_iter()
            .map(|(_, value)| value)
            .collect();
        Ok(take_limit(values, max_results))
    }

    pub async fn get_all_as_map<T: XconfEntity>(&self, table: &str) -> XconfResult<HashMap<String, Arc<T>>> {
        let entries = self.all_entries(table).await?;
        entries
            .into_iter()
            .map(|(key, obj)| typed::<T>(&self.manager, table, &key, obj).map(|v| (key, v)))
            .collect()
    }

    /// Every key of the table, sorted.
    pub async fn get_keys(&self, table: &str) -> XconfResult<Vec<String>> {
        let info = self.manager.registry().get_table_info(table)?;
        let mut keys = match self.manager.table_cache(table) {
            Some(cache) => {
                self.manager.ensure_loaded(table).await?;
                cache.keys()
            }
            None if info.is_compress_and_split() => {
                self.manager.compressing_dao().get_all_keys(&info).await?
            }
            None => self.manager.simple_dao().get_all_keys(&info).await?,
        };
        keys.sort();
        Ok(keys)
    }

    /// Reload the table cache from the store.
    pub async fn refresh_all(&self, table: &str) -> XconfResult<()> {
        self.manager.refresh(table).await
    }

    async fn all_entries(&self, table: &str) -> XconfResult<Vec<(String, CachedObject)>> {
        let info = self.manager.registry().get_table_info(table)?;
        if let Some(cache) = self.manager.table_cache(table) {
            self.manager.ensure_loaded(table).await?;
            return Ok(cache.entries());
        }
        let map = if info.is_compress_and_split() {
            self.manager.compressing_dao().get_all_as_map(&info).await?
        } else {
            self.manager.simple_dao().get_all_as_map(&info).await?
        };
        Ok(map.into_iter().collect())
    }
}

// ============================================================================
// TWO-KEY (LISTING) TABLES
// ============================================================================

/// Cache-backed DAO for two-key listing tables.
///
/// Cache entries are keyed by the `key::key2` composite.
#[derive(Debug, Clone)]
pub struct CachedListingDao {
    manager: Arc<CacheManager>,
}

impl CachedListingDao {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }

    pub async fn get_one<T: XconfEntity>(&self, table: &str, key: &str, key2: &str) -> XconfResult<Arc<T>> {
        let info = self.manager.registry().get_table_info(table)?;
        let composite = TwoKeys::new(key, key2).to_string();
        let obj = match self.manager.table_cache(table) {
            Some(cache) => cache.get(&composite).await?,
            None => self.manager.listing_dao().get_one(&info, key, key2).await?,
        };
        typed(&self.manager, table, &composite, obj)
    }

    pub fn get_one_from_cache_only<T: XconfEntity>(
        &self,
        table: &str,
        key: &str,
        key2: &str,
    ) -> XconfResult<Arc<T>> {
        let composite = TwoKeys::new(key, key2).to_string();
        let obj = self
            .manager
            .cache(table)?
            .get_if_present(&composite)
            .ok_or_else(|| XconfError::not_found(table, composite.as_str()))?;
        typed(&self.manager, table, &composite, obj)
    }

    pub async fn set_one<T: XconfEntity>(
        &self,
        table: &str,
        key: &str,
        key2: &str,
        value: T,
    ) -> XconfResult<()> {
        let info = self.manager.registry().get_table_info(table)?;
        self.manager
            .listing_dao()
            .set_one(&info, key, key2, &value)
            .await?;

        if let Some(cache) = self.manager.table_cache(table) {
            let composite = TwoKeys::new(key, key2).to_string();
            let operation = if cache.contains(&composite) {
                ChangeOperation::Update
            } else {
                ChangeOperation::Create
            };
            cache.put(composite.as_str(), Arc::new(value));
            self.manager.application_cache().delete_all(table);
            self.manager
                .write_cache_log(table, &composite, operation, cache.size());
        }
        Ok(())
    }

    pub async fn delete_one(&self, table: &str, key: &str, key2: &str) -> XconfResult<()> {
        let info = self.manager.registry().get_table_info(table)?;
        self.manager.listing_dao().delete_one(&info, key, key2).await?;

        if let Some(cache) = self.manager.table_cache(table) {
            let composite = TwoKeys::new(key, key2).to_string();
            let size_after = cache.size().saturating_sub(1);
            cache.invalidate(&composite);
            self.manager.application_cache().delete_all(table);
            self.manager
                .write_cache_log(table, &composite, ChangeOperation::Delete, size_after);
        }
        Ok(())
    }

    /// Every value of the row under `key`, ordered by secondary key.
    pub async fn get_all<T: XconfEntity>(&self, table: &str, key: &str) -> XconfResult<Vec<(String, Arc<T>)>> {
        let info = self.manager.registry().get_table_info(table)?;
        let Some(cache) = self.manager.table_cache(table) else {
            let rows = self.manager.listing_dao().get_all(&info, key).await?;
            return rows
                .into_iter()
                .map(|(key2, obj)| typed::<T>(&self.manager, table, &key2, obj).map(|v| (key2, v)))
                .collect();
        };

        self.manager.ensure_loaded(table).await?;
        let row: Vec<(String, CachedObject)> = cache
            .entries()
            .into_iter()
            .filter(|(composite, _)| TwoKeys::has_primary(composite, key))
            .filter_map(|(composite, obj)| TwoKeys::parse(&composite).map(|two| (two.key2, obj)))
            .collect();
        sorted_values::<T>(&self.manager, table, row)
    }

    /// Values of the requested secondary keys that exist.
    pub async fn get_all_as_map<T: XconfEntity>(
        &self,
        table: &str,
        key: &str,
        key2s: &[String],
    ) -> XconfResult<HashMap<String, Arc<T>>> {
        let mut values = HashMap::with_capacity(key2s.len());
        for key2 in key2s {
            match self.get_one::<T>(table, key, key2).await {
                Ok(value) => {
                    values.insert(key2.clone(), value);
                }
                Err(e) if e.is_not_found() && self.manager.registry().contains(table) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }

    /// Every composite key of the table, sorted.
    pub async fn get_keys(&self, table: &str) -> XconfResult<Vec<TwoKeys>> {
        let info = self.manager.registry().get_table_info(table)?;
        let mut keys = match self.manager.table_cache(table) {
            Some(cache) => {
                self.manager.ensure_loaded(table).await?;
                cache
                    .keys()
                    .iter()
                    .filter_map(|composite| TwoKeys::parse(composite))
                    .collect()
            }
            None => self.manager.listing_dao().get_all_keys(&info).await?,
        };
        keys.sort();
        Ok(keys)
    }

    /// Secondary keys stored under `key`, read from the store.
    pub async fn get_key2_as_list(&self, table: &str, key: &str) -> XconfResult<Vec<String>> {
        let info = self.manager.registry().get_table_info(table)?;
        self.manager.listing_dao().get_key2_as_list(&info, key).await
    }

    /// Delete the whole row under `key` and invalidate each of its entries.
    pub async fn delete_all(&self, table: &str, key: &str) -> XconfResult<()> {
        let info = self.manager.registry().get_table_info(table)?;
        let key2s = self.manager.listing_dao().get_key2_as_list(&info, key).await?;
        self.manager.listing_dao().delete_all(&info, key).await?;

        if let Some(cache) = self.manager.table_cache(table) {
            for key2 in &key2s {
                let composite = TwoKeys::new(key, key2.as_str()).to_string();
                cache.invalidate(&composite);
                self.manager.write_cache_log(
                    table,
                    &composite,
                    ChangeOperation::Delete,
                    cache.size(),
                );
            }
            self.manager.application_cache().delete_all(table);
        }
        Ok(())
    }

    /// Reload the table cache from the store.
    pub async fn refresh_all(&self, table: &str) -> XconfResult<()> {
        self.manager.refresh(table).await
    }
}
