//! Application cache for derived values.
//!
//! Holds results computed from table data (evaluated rule sets, merged
//! settings, ...). Entries are keyed `"<table>::<key>"` and are invalidated
//! per table, coarsely, whenever that table's primary cache changes.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use xconf_core::TwoKeys;

#[derive(Debug)]
pub struct ApplicationCache {
    enabled: bool,
    entries: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ApplicationCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn entry_key(table: &str, key: &str) -> String {
        TwoKeys::new(table, key).to_string()
    }

    /// Cached value, if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, table: &str, key: &str) -> Option<Arc<T>> {
        if !self.enabled {
            return None;
        }
        let value = self
            .entries
            .get(&Self::entry_key(table, key))
            .map(|e| Arc::clone(e.value()))?;
        value.downcast::<T>().ok()
    }

    pub fn set<T: Any + Send + Sync>(&self, table: &str, key: &str, value: T) {
        if self.enabled {
            self.entries
                .insert(Self::entry_key(table, key), Arc::new(value));
        }
    }

    pub fn delete(&self, table: &str, key: &str) {
        self.entries.remove(&Self::entry_key(table, key));
    }

    /// Drop every entry belonging to `table`.
    pub fn delete_all(&self, table: &str) {
        self.entries
            .retain(|key, _| !TwoKeys::has_primary(key, table));
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }
}
