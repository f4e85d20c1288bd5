//! Xconf Core - Shared Types
//!
//! Pure data and policy types for the Xconf cache synchronization engine:
//! the error taxonomy, cache settings, composite keys, the changed-keys audit
//! record and its time-bucket arithmetic. No I/O beyond reading a config file.

pub mod changed;
pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod keys;

pub use changed::{bucket_keys, bucket_of, bucket_ranges, ChangeOperation, ChangedData};
pub use config::{CacheSettings, TimeUnit};
pub use error::{CodecError, ConfigError, RegistryError, StorageError, XconfError, XconfResult};
pub use identity::{min_time_ordered_id, now_millis, time_ordered_id, TimestampMs};
pub use keys::{RangeInfo, TwoKeys, TWO_KEYS_DELIMITER};
