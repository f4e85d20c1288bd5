//! Error types for Xconf cache and storage operations

use thiserror::Error;

/// Backing-store and persisted-data errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Key not found in {table}: {key}")]
    NotFound { table: String, key: String },

    #[error("Backing store failure on {table}: {reason}")]
    Backend { table: String, reason: String },

    #[error("Inconsistent data in {table} for {key}: {reason}")]
    InconsistentData {
        table: String,
        key: String,
        reason: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Table registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Table not registered: {table}")]
    TableNotRegistered { table: String },

    #[error("Table {table} has no constructor")]
    ConstructorMissing { table: String },

    #[error("Table {table} is not configured for caching")]
    TableNotCached { table: String },

    #[error("Table registered twice: {table}")]
    DuplicateTable { table: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Invalid time unit: {value}")]
    InvalidTimeUnit { value: String },

    #[error("No DAO id known for table {table}")]
    MissingDaoId { table: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to read configuration: {reason}")]
    Io { reason: String },
}

/// Serialization and payload encoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Serialization failed: {reason}")]
    Serialize { reason: String },

    #[error("Deserialization failed: {reason}")]
    Deserialize { reason: String },

    #[error("Compression failed: {reason}")]
    Compression { reason: String },

    #[error("Cached value for {table}/{key} is not a {expected}")]
    TypeMismatch {
        table: String,
        key: String,
        expected: String,
    },
}

/// Master error type for all Xconf errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum XconfError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl XconfError {
    /// Shorthand for a missing key.
    pub fn not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Storage(StorageError::NotFound {
            table: table.into(),
            key: key.into(),
        })
    }

    /// Shorthand for a backing-store failure.
    pub fn backend(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage(StorageError::Backend {
            table: table.into(),
            reason: reason.into(),
        })
    }

    /// True for every NotFound-class error: absent key, unregistered table,
    /// missing constructor, table without a cache, or missing configuration.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Storage(StorageError::NotFound { .. })
                | Self::Registry(RegistryError::TableNotRegistered { .. })
                | Self::Registry(RegistryError::ConstructorMissing { .. })
                | Self::Registry(RegistryError::TableNotCached { .. })
                | Self::Config(ConfigError::MissingRequired { .. })
        )
    }
}

impl From<serde_json::Error> for XconfError {
    fn from(e: serde_json::Error) -> Self {
        let reason = e.to_string();
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Self::Codec(CodecError::Deserialize { reason })
        } else {
            Self::Codec(CodecError::Serialize { reason })
        }
    }
}

/// Result type alias for Xconf operations.
pub type XconfResult<T> = Result<T, XconfError>;

// =============================================================================
// TESTS
// =============================================================================
