//! Single-key table DAO.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use xconf_core::XconfResult;

use super::{construct_or_skip, encode};
use crate::client::DatabaseClient;
use crate::registry::{CachedObject, TableInfo};

/// Reads and writes one JSON value per key.
#[derive(Clone)]
pub struct SimpleDao {
    client: Arc<dyn DatabaseClient>,
}

impl SimpleDao {
    pub fn new(client: Arc<dyn DatabaseClient>) -> Self {
        Self { client }
    }

    pub async fn set_one<T: Serialize + ?Sized>(
        &self,
        info: &TableInfo,
        key: &str,
        value: &T,
    ) -> XconfResult<()> {
        let bytes = encode(value)?;
        self.client
            .set_one(&info.name, key, bytes, info.ttl_secs)
            .await
    }

    pub async fn get_one(&self, info: &TableInfo, key: &str) -> XconfResult<CachedObject> {
        let bytes = self.client.get_one(&info.name, key).await?;
        info.construct(&bytes)
    }

    /// Existing values for `keys`; absent keys are omitted.
    pub async fn get_all_by_keys(
        &self,
        info: &TableInfo,
        keys: &[String],
    ) -> XconfResult<Vec<(String, CachedObject)>> {
        let rows = self.client.get_all_by_keys(&info.name, keys).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, bytes)| construct_or_skip(info, &key, &bytes).map(|obj| (key, obj)))
            .collect())
    }

    pub async fn get_all_keys(&self, info: &TableInfo) -> XconfResult<Vec<String>> {
        self.client.get_all_keys(&info.name).await
    }

    pub async fn get_all_as_list(
        &self,
        info: &TableInfo,
        max_results: usize,
    ) -> XconfResult<Vec<CachedObject>> {
        let rows = self.client.get_all_as_list(&info.name, max_results).await?;
        Ok(rows
            .iter()
            .filter_map(|bytes| construct_or_skip(info, "", bytes))
            .collect())
    }

    pub async fn get_all_as_map(&self, info: &TableInfo) -> XconfResult<HashMap<String, CachedObject>> {
        let rows = self.client.get_all_as_map(&info.name).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, bytes)| construct_or_skip(info, &key, &bytes).map(|obj| (key, obj)))
            .collect())
    }

    pub async fn delete_one(&self, info: &TableInfo, key: &str) -> XconfResult<()> {
        self.client.delete_one(&info.name, key).await
    }
}
