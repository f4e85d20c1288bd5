//! Compressed and chunked single-value DAO.
//!
//! A value is JSON-encoded, gzipped and split into fixed-size chunks. Each
//! chunk is stored as a cell of the value's row under
//! `NamedListData_part_<i>`, next to a `NamedListData_parts_count` cell
//! holding the decimal chunk count. All cells share the table TTL.
//!
//! After the new chunks are written, every other part cell of the row is
//! deleted, whether it was part of the previous value or left behind by a
//! writer that never pruned. Prune failures are logged, not returned.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use xconf_core::constants::{
    compressed_part_key, COMPRESSED_CHUNK_SIZE, COMPRESSED_PARTS_COUNT_KEY,
    COMPRESSED_PART_KEY_PREFIX,
};
use xconf_core::{StorageError, XconfResult};

use super::compression::{compress, decompress, join_chunks, split_chunks};
use super::encode;
use crate::client::{DatabaseClient, RowCells};
use crate::registry::{CachedObject, TableInfo};

#[derive(Clone)]
pub struct CompressingDataDao {
    client: Arc<dyn DatabaseClient>,
    chunk_size: usize,
}

impl CompressingDataDao {
    pub fn new(client: Arc<dyn DatabaseClient>) -> Self {
        Self {
            client,
            chunk_size: COMPRESSED_CHUNK_SIZE,
        }
    }

    /// Use a smaller chunk size. Only meaningful for tests.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub async fn set_one<T: Serialize + ?Sized>(
        &self,
        info: &TableInfo,
        key: &str,
        value: &T,
    ) -> XconfResult<()> {
        let packed = compress(&encode(value)?)?;
        let chunks = split_chunks(&packed, self.chunk_size);
        let new_count = chunks.len();

        let stale = match self.client.get_compressed_data(&info.name, key).await {
            Ok(cells) => stale_parts(&cells, new_count),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut cells = Vec::with_capacity(new_count + 1);
        cells.push((
            COMPRESSED_PARTS_COUNT_KEY.to_string(),
            new_count.to_string().into_bytes(),
        ));
        cells.extend(
            chunks
                .into_iter()
                .enumerate()
                .map(|(i, chunk)| (compressed_part_key(i), chunk)),
        );
        self.client
            .set_compressed_data(&info.name, key, cells, info.ttl_secs)
            .await?;

        // the new value is already stored; a failed prune only leaks cells
        let mut pruned = 0usize;
        for part in &stale {
            match self.client.delete_two_keys(&info.name, key, part).await {
                Ok(()) => pruned += 1,
                Err(e) => warn!(
                    table = %info.name,
                    key = %key,
                    part = %part,
                    error = %e,
                    "Failed to prune orphaned compressed chunk"
                ),
            }
        }
        if pruned > 0 {
            debug!(table = %info.name, key = %key, pruned, "Pruned orphaned compressed chunks");
        }
        Ok(())
    }

    /// Read and reassemble one value.
    ///
    /// Fails with `InconsistentData` when the stored count disagrees with the
    /// chunks present.
    pub async fn get_one(&self, info: &TableInfo, key: &str) -> XconfResult<CachedObject> {
        let cells = self.client.get_compressed_data(&info.name, key).await?;
        let payload = assemble(&info.name, key, &cells, true)?;
        info.construct(&decompress(&payload)?)
    }

    /// Every value of the table. Rows that fail to assemble or decode are
    /// logged and skipped; chunks beyond the stored count are ignored.
    pub async fn get_all_as_map(&self, info: &TableInfo) -> XconfResult<HashMap<String, CachedObject>> {
        let rows = self
            .client
            .get_all_compressed_data_as_map(&info.name)
            .await?;

        let mut values = HashMap::with_capacity(rows.len());
        for (key, cells) in rows {
            let decoded = assemble(&info.name, &key, &cells, false)
                .and_then(|payload| decompress(&payload))
                .and_then(|json| info.construct(&json));
            match decoded {
                Ok(obj) => {
                    values.insert(key, obj);
                }
                Err(e) => {
                    warn!(table = %info.name, key = %key, error = %e, "Skipping unreadable compressed row");
                }
            }
        }
        Ok(values)
    }

    pub async fn get_all_keys(&self, info: &TableInfo) -> XconfResult<Vec<String>> {
        let keys: BTreeSet<String> = self
            .client
            .get_all_two_keys(&info.name)
            .await?
            .into_iter()
            .map(|two| two.key)
            .collect();
        Ok(keys.into_iter().collect())
    }

    /// Row-wide delete of the count and every chunk.
    pub async fn delete_one(&self, info: &TableInfo, key: &str) -> XconfResult<()> {
        self.client.delete_all(&info.name, key).await
    }
}

fn stored_part_count(cells: &RowCells) -> Option<usize> {
    cells
        .get(COMPRESSED_PARTS_COUNT_KEY)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Part cells that a value of `new_count` chunks does not overwrite,
/// including any left above the stored count by earlier writers.
fn stale_parts(cells: &RowCells, new_count: usize) -> Vec<String> {
    cells
        .keys()
        .filter_map(|k| k.strip_prefix(COMPRESSED_PART_KEY_PREFIX).map(|idx| (k, idx)))
        .filter(|(_, idx)| idx.parse::<usize>().map_or(true, |i| i >= new_count))
        .map(|(k, _)| k.clone())
        .collect()
}

fn inconsistent(table: &str, key: &str, reason: String) -> xconf_core::XconfError {
    StorageError::InconsistentData {
        table: table.to_string(),
        key: key.to_string(),
        reason,
    }
    .into()
}

/// Concatenate chunks `0..count` of a row.
///
/// In strict mode extra chunks are an error as well as missing ones.
fn assemble(table: &str, key: &str, cells: &RowCells, strict: bool) -> XconfResult<Vec<u8>> {
    let count = stored_part_count(cells)
        .ok_or_else(|| inconsistent(table, key, "missing or invalid parts count".to_string()))?;

    let present = cells
        .keys()
        .filter(|k| k.starts_with(COMPRESSED_PART_KEY_PREFIX))
        .count();
    if strict && present != count {
        return Err(inconsistent(
            table,
            key,
            format!("expected {} parts, found {}", count, present),
        ));
    }

    let mut chunks = Vec::with_capacity(count);
    for index in 0..count {
        let chunk = cells.get(&compressed_part_key(index)).ok_or_else(|| {
            inconsistent(table, key, format!("expected {} parts, part {} is missing", count, index))
        })?;
        chunks.push(chunk.clone());
    }
    Ok(join_chunks(&chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryDatabaseClient;
    use serde::Deserialize;
    use xconf_core::XconfError;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct NamedList {
        id: String,
        data: Vec<String>,
    }

    fn list(id: &str, entries: usize) -> NamedList {
        NamedList {
            id: id.to_string(),
            // distinct entries so gzip cannot collapse the payload
            data: (0..entries)
                .map(|i| format!("{:016x}", (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)))
                .collect(),
        }
    }

    fn setup(chunk_size: usize) -> (Arc<InMemoryDatabaseClient>, CompressingDataDao, TableInfo) {
        let client = Arc::new(InMemoryDatabaseClient::new());
        let dao = CompressingDataDao::new(client.clone()).with_chunk_size(chunk_size);
        let info = TableInfo::of::<NamedList>("GenericXconfNamedList").compress_and_split();
        (client, dao, info)
    }

    #[tokio::test]
    async fn test_round_trip_multi_chunk() {
        let (client, dao, info) = setup(256);
        let value = list("big", 500);
        dao.set_one(&info, "big", &value).await.unwrap();

        assert!(client.row_len(&info.name, "big") > 3);
        let obj = dao.get_one(&info, "big").await.unwrap();
        assert_eq!(*obj.downcast::<NamedList>().unwrap(), value);
    }

    #[tokio::test]
    async fn test_round_trip_default_chunk_size() {
        let (client, dao, info) = setup(COMPRESSED_CHUNK_SIZE);
        let value = list("small", 3);
        dao.set_one(&info, "small", &value).await.unwrap();

        assert_eq!(client.row_len(&info.name, "small"), 2);
        let obj = dao.get_one(&info, "small").await.unwrap();
        assert_eq!(*obj.downcast::<NamedList>().unwrap(), value);
    }

    #[tokio::test]
    async fn test_shrinking_overwrite_prunes_orphans() {
        let (client, dao, info) = setup(256);
        dao.set_one(&info, "l", &list("l", 500)).await.unwrap();
        let before = client.row_len(&info.name, "l");

        let small = list("l", 1);
        dao.set_one(&info, "l", &small).await.unwrap();
        let after = client.row_len(&info.name, "l");

        assert!(after < before);
        assert_eq!(after, 2);
        let obj = dao.get_one(&info, "l").await.unwrap();
        assert_eq!(*obj.downcast::<NamedList>().unwrap(), small);
    }

    #[tokio::test]
    async fn test_overwrite_heals_parts_above_stored_count() {
        let (client, dao, info) = setup(COMPRESSED_CHUNK_SIZE);
        dao.set_one(&info, "l", &list("l", 2)).await.unwrap();
        // cells a non-pruning writer would leave behind
        for index in [1, 2] {
            client
                .set_two_keys(&info.name, "l", &compressed_part_key(index), vec![0xde, 0xad], 0)
                .await
                .unwrap();
        }
        assert!(dao.get_one(&info, "l").await.is_err());

        let value = list("l", 3);
        dao.set_one(&info, "l", &value).await.unwrap();
        assert_eq!(client.row_len(&info.name, "l"), 2);
        let obj = dao.get_one(&info, "l").await.unwrap();
        assert_eq!(*obj.downcast::<NamedList>().unwrap(), value);
    }

    #[test]
    fn test_stale_parts_selection() {
        let mut cells = RowCells::new();
        cells.insert(COMPRESSED_PARTS_COUNT_KEY.to_string(), b"1".to_vec());
        for index in 0..4 {
            cells.insert(compressed_part_key(index), vec![index as u8]);
        }
        cells.insert(format!("{}junk", COMPRESSED_PART_KEY_PREFIX), vec![]);

        let mut stale = stale_parts(&cells, 2);
        stale.sort();
        let mut expected = vec![
            compressed_part_key(2),
            compressed_part_key(3),
            format!("{}junk", COMPRESSED_PART_KEY_PREFIX),
        ];
        expected.sort();
        assert_eq!(stale, expected);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_inconsistent() {
        let (client, dao, info) = setup(256);
        dao.set_one(&info, "l", &list("l", 500)).await.unwrap();
        client
            .delete_two_keys(&info.name, "l", &compressed_part_key(1))
            .await
            .unwrap();

        let err = dao.get_one(&info, "l").await.unwrap_err();
        assert!(matches!(
            err,
            XconfError::Storage(StorageError::InconsistentData { .. })
        ));
        assert!(dao.get_all_as_map(&info).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extra_chunk_strict_vs_bulk() {
        let (client, dao, info) = setup(COMPRESSED_CHUNK_SIZE);
        let value = list("l", 2);
        dao.set_one(&info, "l", &value).await.unwrap();
        client
            .set_two_keys(&info.name, "l", &compressed_part_key(5), vec![1, 2, 3], 0)
            .await
            .unwrap();

        assert!(matches!(
            dao.get_one(&info, "l").await.unwrap_err(),
            XconfError::Storage(StorageError::InconsistentData { .. })
        ));

        let all = dao.get_all_as_map(&info).await.unwrap();
        let obj = all.get("l").cloned().unwrap();
        assert_eq!(*obj.downcast::<NamedList>().unwrap(), value);
    }

    #[tokio::test]
    async fn test_delete_removes_whole_row() {
        let (client, dao, info) = setup(256);
        dao.set_one(&info, "l", &list("l", 300)).await.unwrap();
        dao.set_one(&info, "m", &list("m", 1)).await.unwrap();
        assert_eq!(dao.get_all_keys(&info).await.unwrap(), vec!["l", "m"]);

        dao.delete_one(&info, "l").await.unwrap();
        assert_eq!(client.row_len(&info.name, "l"), 0);
        assert!(dao.get_one(&info, "l").await.unwrap_err().is_not_found());
        assert_eq!(dao.get_all_keys(&info).await.unwrap(), vec!["m"]);
    }
}
