//! Xconf Test Utilities
//!
//! Shared test infrastructure for the Xconf workspace:
//! - Entity fixtures and a registry wired like a small deployment
//! - Proptest generators for keys, entities and audit records
//! - Custom assertions for Xconf error variants
//! - One-shot tracing setup for tests

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

pub use xconf_core::constants::{
    CHANGED_KEYS_TABLE, TABLE_ENVIRONMENT, TABLE_LOG_FILE_LIST, TABLE_MODEL, TABLE_NAMED_LIST,
};
pub use xconf_core::{
    CacheSettings, ChangeOperation, ChangedData, RegistryError, StorageError, TwoKeys, XconfError,
    XconfResult,
};
pub use xconf_storage::{CacheManager, InMemoryDatabaseClient, TableInfo, TableRegistry};

// ============================================================================
// TEST ENTITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub description: String,
}

impl Model {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            description: format!("{} model", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub description: String,
}

impl Environment {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            description: format!("{} environment", id),
        }
    }
}

/// A named list large enough to exercise the compressed layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedList {
    pub id: String,
    pub type_name: String,
    pub data: Vec<String>,
}

impl NamedList {
    pub fn new(id: &str, entries: usize) -> Self {
        Self {
            id: id.to_string(),
            type_name: "MAC_LIST".to_string(),
            data: (0..entries)
                .map(|i| format!("AA:BB:CC:{:02X}:{:02X}:{:02X}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff))
                .collect(),
        }
    }
}

/// A log file entry, stored in the two-key `LogFileList` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFile {
    pub id: String,
    pub name: String,
    pub delete_on_upload: bool,
}

impl LogFile {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: format!("{}.log", id),
            delete_on_upload: false,
        }
    }
}

// ============================================================================
// TRACING
// ============================================================================

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a test-writer subscriber once per process. Honors `RUST_LOG`.
pub fn init_test_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Xconf keys and records.

    use super::*;
    use proptest::prelude::*;

    /// A table key: never empty, never containing the two-key delimiter.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{1,24}"
    }

    pub fn arb_two_keys() -> impl Strategy<Value = TwoKeys> {
        (arb_key(), arb_key()).prop_map(|(key, key2)| TwoKeys::new(key, key2))
    }

    pub fn arb_model() -> impl Strategy<Value = Model> {
        (arb_key(), ".{0,64}").prop_map(|(id, description)| Model { id, description })
    }

    pub fn arb_named_list() -> impl Strategy<Value = NamedList> {
        (arb_key(), prop::collection::vec("[0-9A-F:]{17}", 0..64))
            .prop_map(|(id, data)| NamedList {
                id,
                type_name: "MAC_LIST".to_string(),
                data,
            })
    }

    pub fn arb_operation() -> impl Strategy<Value = ChangeOperation> {
        prop_oneof![
            Just(ChangeOperation::Create),
            Just(ChangeOperation::Update),
            Just(ChangeOperation::Delete),
            Just(ChangeOperation::TruncateCf),
        ]
    }

    /// Millisecond timestamps within a few days of 2024-01-01.
    pub fn arb_timestamp_ms() -> impl Strategy<Value = i64> {
        1_704_067_200_000i64..1_704_412_800_000i64
    }

    pub fn arb_window_ms() -> impl Strategy<Value = i64> {
        prop_oneof![Just(60_000i64), Just(900_000i64), 1_000i64..3_600_000i64]
    }

    pub fn arb_changed_data() -> impl Strategy<Value = ChangedData> {
        (arb_key(), arb_operation(), 0usize..10_000)
            .prop_map(|(key, op, size)| ChangedData::new(TABLE_MODEL, key, op, 1, size, "prop"))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built registries, settings and managers.

    use super::*;

    /// Registry with a cached single-key table (`Model`), an uncached one
    /// (`Environment`), a cached compressed table (`GenericXconfNamedList`)
    /// and a cached listing table (`LogFileList`).
    pub fn test_registry() -> TableRegistry {
        let mut registry = TableRegistry::new();
        let tables = [
            TableInfo::of::<Model>(TABLE_MODEL).cached(),
            TableInfo::of::<Environment>(TABLE_ENVIRONMENT),
            TableInfo::of::<NamedList>(TABLE_NAMED_LIST)
                .compress_and_split()
                .cached(),
            TableInfo::of::<LogFile>(TABLE_LOG_FILE_LIST)
                .listing()
                .cached(),
        ];
        for info in tables {
            if let Err(e) = registry.register(info) {
                panic!("test registry: {}", e);
            }
        }
        registry
    }

    /// Settings with a short tick and a one-minute bucket window.
    pub fn test_settings() -> CacheSettings {
        CacheSettings::default()
            .with_tick_duration(Duration::from_millis(50))
            .with_retry_count(3)
            .with_time_window_ms(60_000)
            .with_audit_queue(1024, 2)
            .with_user_name("xconf-test")
    }

    /// A manager over `client` using [`test_registry`].
    ///
    /// Must be called within a Tokio runtime.
    pub fn test_manager(
        client: Arc<InMemoryDatabaseClient>,
        settings: CacheSettings,
    ) -> Arc<CacheManager> {
        match CacheManager::new(client, Arc::new(test_registry()), settings) {
            Ok(manager) => manager,
            Err(e) => panic!("test manager: {}", e),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Xconf error variants.

    use super::*;

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &XconfResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound-class error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &XconfResult<T>) {
        match result {
            Err(XconfError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_backend_error<T: std::fmt::Debug>(result: &XconfResult<T>) {
        match result {
            Err(XconfError::Storage(StorageError::Backend { .. })) => {}
            other => panic!("Expected Backend error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_cached<T: std::fmt::Debug>(result: &XconfResult<T>) {
        match result {
            Err(XconfError::Registry(RegistryError::TableNotCached { .. })) => {}
            other => panic!("Expected TableNotCached error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_registry_layout() {
        let registry = test_registry();
        // four tables plus the changed-keys log
        assert_eq!(registry.len(), 5);
        let cached: Vec<_> = registry
            .cacheable_tables()
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(cached, vec![TABLE_NAMED_LIST, TABLE_LOG_FILE_LIST, TABLE_MODEL]);
    }

    #[test]
    fn test_settings_are_valid() {
        assert!(test_settings().validate().is_ok());
    }

    #[test]
    fn test_named_list_entries_are_distinct() {
        let list = NamedList::new("macs", 300);
        let mut data = list.data.clone();
        data.dedup();
        assert_eq!(data.len(), 300);
    }

    proptest! {
        #[test]
        fn prop_generated_keys_round_trip(two in arb_two_keys()) {
            let parsed = TwoKeys::parse(&two.to_string());
            prop_assert_eq!(parsed, Some(two));
        }
    }
}
