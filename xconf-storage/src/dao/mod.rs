//! Table DAOs.
//!
//! DAOs translate between domain values and the opaque byte payloads of the
//! [`DatabaseClient`](crate::client::DatabaseClient). Values are JSON; the
//! compressing DAO additionally gzips and splits the payload into chunks.

pub mod compressing;
pub mod compression;
pub mod listing;
pub mod simple;

pub use compressing::CompressingDataDao;
pub use listing::ListingDao;
pub use simple::SimpleDao;

use serde::Serialize;
use tracing::warn;
use xconf_core::XconfResult;

use crate::registry::{CachedObject, TableInfo};

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> XconfResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Construct a value read by a bulk operation, logging and dropping payloads
/// that no longer decode.
pub(crate) fn construct_or_skip(info: &TableInfo, key: &str, bytes: &[u8]) -> Option<CachedObject> {
    match info.construct(bytes) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!(table = %info.name, key = %key, error = %e, "Skipping undecodable record");
            None
        }
    }
}
