//! Per-table metadata registry.
//!
//! Every table the DAOs touch is described by a [`TableInfo`]: how to build a
//! value from stored bytes, whether the table is compressed and split, cached,
//! stored as a two-key listing, its TTL and its DAO id. Registration happens
//! once at startup; the registry is then shared immutably behind an `Arc`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use xconf_core::constants::{dao_id_for, CHANGED_KEYS_TABLE, DEFAULT_KEY2_FIELD_NAME};
use xconf_core::{ChangedData, ConfigError, RegistryError, XconfResult};

/// A type-erased cached value.
pub type CachedObject = Arc<dyn Any + Send + Sync>;

/// Builds a cached value from its stored JSON payload.
pub type Constructor = fn(&[u8]) -> XconfResult<CachedObject>;

/// Domain types that can be stored in a registered table.
pub trait XconfEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> XconfEntity for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

fn construct_entity<T: XconfEntity>(bytes: &[u8]) -> XconfResult<CachedObject> {
    let value: T = serde_json::from_slice(bytes)?;
    Ok(Arc::new(value))
}

/// Static metadata for one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub constructor: Option<Constructor>,
    /// Rust type name of the entity, for diagnostics.
    pub type_name: Option<&'static str>,
    pub compress: bool,
    pub split: bool,
    pub cache_data: bool,
    /// Seconds; 0 means no expiry.
    pub ttl_secs: u32,
    pub key2_field_name: String,
    pub dao_id: Option<i32>,
    /// Rows are addressed by [`xconf_core::TwoKeys`].
    pub listing: bool,
}

impl TableInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            type_name: None,
            compress: false,
            split: false,
            cache_data: false,
            ttl_secs: 0,
            key2_field_name: String::new(),
            dao_id: None,
            listing: false,
        }
    }

    /// Shorthand for `TableInfo::new(name).entity::<T>()`.
    pub fn of<T: XconfEntity>(name: impl Into<String>) -> Self {
        Self::new(name).entity::<T>()
    }

    pub fn entity<T: XconfEntity>(mut self) -> Self {
        self.constructor = Some(construct_entity::<T> as Constructor);
        self.type_name = Some(std::any::type_name::<T>());
        self
    }

    pub fn compress_and_split(mut self) -> Self {
        self.compress = true;
        self.split = true;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache_data = true;
        self
    }

    pub fn listing(mut self) -> Self {
        self.listing = true;
        self
    }

    pub fn ttl(mut self, ttl_secs: u32) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn key2_field_name(mut self, name: impl Into<String>) -> Self {
        self.key2_field_name = name.into();
        self
    }

    pub fn dao_id(mut self, dao_id: i32) -> Self {
        self.dao_id = Some(dao_id);
        self
    }

    pub fn is_compress_and_split(&self) -> bool {
        self.compress && self.split
    }

    /// DAO id resolved at registration.
    pub fn resolved_dao_id(&self) -> i32 {
        self.dao_id.unwrap_or_default()
    }

    /// Build a cached value from stored bytes.
    pub fn construct(&self, bytes: &[u8]) -> XconfResult<CachedObject> {
        let ctor = self.constructor.ok_or_else(|| RegistryError::ConstructorMissing {
            table: self.name.clone(),
        })?;
        ctor(bytes)
    }
}

/// Registry of every table known to the process.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: HashMap<String, Arc<TableInfo>>,
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TableRegistry {
    /// Create a registry holding only the changed-keys log table.
    pub fn new() -> Self {
        let changed_keys = TableInfo::of::<ChangedData>(CHANGED_KEYS_TABLE)
            .listing()
            .key2_field_name(DEFAULT_KEY2_FIELD_NAME);
        let changed_keys = TableInfo {
            dao_id: dao_id_for(CHANGED_KEYS_TABLE),
            ..changed_keys
        };

        let mut tables = HashMap::new();
        tables.insert(CHANGED_KEYS_TABLE.to_string(), Arc::new(changed_keys));
        Self { tables }
    }

    /// Register a table.
    ///
    /// Defaults the key2 field name and resolves the DAO id from the static
    /// table when not given explicitly.
    pub fn register(&mut self, mut info: TableInfo) -> XconfResult<()> {
        if self.tables.contains_key(&info.name) {
            return Err(RegistryError::DuplicateTable { table: info.name }.into());
        }
        if info.key2_field_name.is_empty() {
            info.key2_field_name = DEFAULT_KEY2_FIELD_NAME.to_string();
        }
        if info.dao_id.is_none() {
            let dao_id = dao_id_for(&info.name).ok_or_else(|| ConfigError::MissingDaoId {
                table: info.name.clone(),
            })?;
            info.dao_id = Some(dao_id);
        }
        self.tables.insert(info.name.clone(), Arc::new(info));
        Ok(())
    }

    /// Register a cached single-key table of `T`.
    pub fn register_simple<T: XconfEntity>(&mut self, name: &str) -> XconfResult<()> {
        self.register(TableInfo::of::<T>(name).cached())
    }

    /// Metadata of a registered table with a constructor.
    pub fn get_table_info(&self, name: &str) -> XconfResult<Arc<TableInfo>> {
        let info = self
            .tables
            .get(name)
            .ok_or_else(|| RegistryError::TableNotRegistered {
                table: name.to_string(),
            })?;
        if info.constructor.is_none() {
            return Err(RegistryError::ConstructorMissing {
                table: name.to_string(),
            }
            .into());
        }
        Ok(Arc::clone(info))
    }

    /// Tables with caching enabled, ordered by name.
    pub fn cacheable_tables(&self) -> Vec<Arc<TableInfo>> {
        let mut tables: Vec<_> = self
            .tables
            .values()
            .filter(|info| info.cache_data)
            .cloned()
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
