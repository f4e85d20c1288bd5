//! Two-key (listing) table DAO.
//!
//! A listing row is addressed by a primary key and holds many cells ordered
//! by secondary key. The changed-keys audit log is stored this way, with the
//! time bucket as primary key and a time-ordered id as secondary key.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use xconf_core::{RangeInfo, TwoKeys, XconfResult};

use super::{construct_or_skip, encode};
use crate::client::DatabaseClient;
use crate::registry::{CachedObject, TableInfo};

#[derive(Clone)]
pub struct ListingDao {
    client: Arc<dyn DatabaseClient>,
}

impl ListingDao {
    pub fn new(client: Arc<dyn DatabaseClient>) -> Self {
        Self { client }
    }

    pub async fn set_one<T: Serialize + ?Sized>(
        &self,
        info: &TableInfo,
        key: &str,
        key2: &str,
        value: &T,
    ) -> XconfResult<()> {
        let bytes = encode(value)?;
        self.client
            .set_two_keys(&info.name, key, key2, bytes, info.ttl_secs)
            .await
    }

    pub async fn get_one(&self, info: &TableInfo, key: &str, key2: &str) -> XconfResult<CachedObject> {
        let bytes = self.client.get_two_keys(&info.name, key, key2).await?;
        info.construct(&bytes)
    }

    pub async fn delete_one(&self, info: &TableInfo, key: &str, key2: &str) -> XconfResult<()> {
        self.client.delete_two_keys(&info.name, key, key2).await
    }

    /// Every value of the row, ordered by secondary key.
    pub async fn get_all(&self, info: &TableInfo, key: &str) -> XconfResult<Vec<(String, CachedObject)>> {
        let cells = self.client.get_all(&info.name, key).await?;
        Ok(cells
            .into_iter()
            .filter_map(|(key2, bytes)| {
                construct_or_skip(info, &key2, &bytes).map(|obj| (key2, obj))
            })
            .collect())
    }

    pub async fn get_all_as_map(
        &self,
        info: &TableInfo,
        key: &str,
        key2s: &[String],
    ) -> XconfResult<HashMap<String, CachedObject>> {
        let cells = self
            .client
            .get_all_two_keys_as_map(&info.name, key, key2s)
            .await?;
        Ok(cells
            .into_iter()
            .filter_map(|(key2, bytes)| {
                construct_or_skip(info, &key2, &bytes).map(|obj| (key2, obj))
            })
            .collect())
    }

    pub async fn get_key2_as_list(&self, info: &TableInfo, key: &str) -> XconfResult<Vec<String>> {
        self.client.get_all_key2s(&info.name, key).await
    }

    pub async fn get_all_keys(&self, info: &TableInfo) -> XconfResult<Vec<TwoKeys>> {
        self.client.get_all_two_keys(&info.name).await
    }

    /// Delete the whole row under `key`.
    pub async fn delete_all(&self, info: &TableInfo, key: &str) -> XconfResult<()> {
        self.client.delete_all(&info.name, key).await
    }

    /// Raw cells of one row within `range`, for callers that decode leniently.
    pub async fn get_range(
        &self,
        info: &TableInfo,
        key: &str,
        range: &RangeInfo,
    ) -> XconfResult<Vec<(String, Vec<u8>)>> {
        self.client
            .get_all_two_keys_range(&info.name, key, range)
            .await
    }

    /// Every value of the table keyed by its `key::key2` composite.
    pub async fn get_all_rows(&self, info: &TableInfo) -> XconfResult<HashMap<String, CachedObject>> {
        let primaries: BTreeSet<String> = self
            .get_all_keys(info)
            .await?
            .into_iter()
            .map(|two| two.key)
            .collect();

        let mut rows = HashMap::new();
        for key in primaries {
            for (key2, obj) in self.get_all(info, &key).await? {
                rows.insert(TwoKeys::new(key.clone(), key2).to_string(), obj);
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryDatabaseClient;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct LogFile {
        name: String,
    }

    fn setup() -> (ListingDao, TableInfo) {
        let client = Arc::new(InMemoryDatabaseClient::new());
        (ListingDao::new(client), TableInfo::of::<LogFile>("LogFileList").listing())
    }

    fn log(name: &str) -> LogFile {
        LogFile {
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_set_get_delete_one() {
        let (dao, info) = setup();
        dao.set_one(&info, "list", "a", &log("a")).await.unwrap();

        let obj = dao.get_one(&info, "list", "a").await.unwrap();
        assert_eq!(*obj.downcast::<LogFile>().unwrap(), log("a"));

        dao.delete_one(&info, "list", "a").await.unwrap();
        assert!(dao.get_one(&info, "list", "a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_row_scans() {
        let (dao, info) = setup();
        for key2 in ["b", "a", "c"] {
            dao.set_one(&info, "list", key2, &log(key2)).await.unwrap();
        }
        dao.set_one(&info, "other", "z", &log("z")).await.unwrap();

        let row = dao.get_all(&info, "list").await.unwrap();
        let order: Vec<_> = row.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        assert_eq!(
            dao.get_key2_as_list(&info, "list").await.unwrap(),
            vec!["a", "b", "c"]
        );

        let subset = dao
            .get_all_as_map(&info, "list", &["a".to_string(), "q".to_string()])
            .await
            .unwrap();
        assert_eq!(subset.len(), 1);

        assert_eq!(dao.get_all_keys(&info).await.unwrap().len(), 4);

        let rows = dao.get_all_rows(&info).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.contains_key("list::b"));
        assert!(rows.contains_key("other::z"));
    }

    #[tokio::test]
    async fn test_delete_all_row() {
        let (dao, info) = setup();
        dao.set_one(&info, "list", "a", &log("a")).await.unwrap();
        dao.set_one(&info, "list", "b", &log("b")).await.unwrap();
        dao.delete_all(&info, "list").await.unwrap();
        assert!(dao.get_all(&info, "list").await.unwrap().is_empty());
    }
}
