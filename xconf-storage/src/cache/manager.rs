//! Cache manager and cross-instance synchronization protocol.
//!
//! The manager owns one [`LoadingCache`] per cacheable table, the shared
//! [`ApplicationCache`], the audit log writer and the refresh task. Instances
//! never notify each other directly: every cache-backed write appends a
//! [`ChangedData`] record to the changed-keys log, and each instance
//! periodically scans the buckets it has not seen and replays them locally.
//!
//! # Locking
//!
//! `refresh_all`, `refresh`, `sync_changes` and `apply_changes` serialize on a
//! single async mutex. The table-to-cache map is built in [`CacheManager::new`]
//! and never changes afterwards, so lookups take no lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use xconf_core::constants::{dao_id_for, CHANGED_KEYS_TABLE};
use xconf_core::{
    bucket_ranges, now_millis, CacheSettings, ChangeOperation, ChangedData, RegistryError,
    StorageError, TimestampMs, TwoKeys, XconfError, XconfResult,
};

use super::application::ApplicationCache;
use super::audit::{AuditLogSnapshot, AuditLogWriter};
use super::loading::{CacheLoader, LoadingCache};
use super::refresh_task::{CacheRefreshSnapshot, CacheRefreshTask, CacheSynchronizer};
use super::stats::CacheStats;
use crate::client::DatabaseClient;
use crate::dao::{CompressingDataDao, ListingDao, SimpleDao};
use crate::registry::{CachedObject, TableInfo, TableRegistry};

/// Loader dispatching to the DAO matching the table layout.
struct TableLoader {
    info: Arc<TableInfo>,
    simple: SimpleDao,
    listing: ListingDao,
    compressing: CompressingDataDao,
}

#[async_trait]
impl CacheLoader for TableLoader {
    async fn load(&self, key: &str) -> XconfResult<CachedObject> {
        if self.info.is_compress_and_split() {
            self.compressing.get_one(&self.info, key).await
        } else if self.info.listing {
            let two = TwoKeys::parse(key).ok_or_else(|| XconfError::not_found(&self.info.name, key))?;
            self.listing.get_one(&self.info, &two.key, &two.key2).await
        } else {
            self.simple.get_one(&self.info, key).await
        }
    }

    async fn load_all(&self) -> XconfResult<HashMap<String, CachedObject>> {
        if self.info.is_compress_and_split() {
            self.compressing.get_all_as_map(&self.info).await
        } else if self.info.listing {
            self.listing.get_all_rows(&self.info).await
        } else {
            self.simple.get_all_as_map(&self.info).await
        }
    }
}

/// One table cache and when it was last fully loaded.
pub struct CacheInfo {
    pub cache: LoadingCache,
    /// Milliseconds since the epoch; 0 until the first full load.
    last_refreshed: AtomicI64,
}

impl CacheInfo {
    pub fn last_refreshed(&self) -> Option<TimestampMs> {
        match self.last_refreshed.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }
}

pub struct CacheManager {
    client: Arc<dyn DatabaseClient>,
    registry: Arc<TableRegistry>,
    settings: CacheSettings,
    caches: HashMap<String, CacheInfo>,
    table_names: Vec<String>,
    application_cache: ApplicationCache,
    refresh_lock: tokio::sync::Mutex<()>,
    changed_keys: Arc<TableInfo>,
    audit: AuditLogWriter,
    simple_dao: SimpleDao,
    listing_dao: ListingDao,
    compressing_dao: CompressingDataDao,
    refresh_task: Mutex<Option<CacheRefreshTask>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("tables", &self.table_names)
            .field("settings", &self.settings)
            .finish()
    }
}

impl CacheManager {
    /// Build the manager without precaching or starting the refresh task.
    ///
    /// Must be called within a Tokio runtime; the audit log workers start
    /// immediately.
    pub fn new(
        client: Arc<dyn DatabaseClient>,
        registry: Arc<TableRegistry>,
        settings: CacheSettings,
    ) -> XconfResult<Arc<Self>> {
        settings.validate()?;
        let changed_keys = registry.get_table_info(CHANGED_KEYS_TABLE)?;

        let simple_dao = SimpleDao::new(Arc::clone(&client));
        let listing_dao = ListingDao::new(Arc::clone(&client));
        let compressing_dao = CompressingDataDao::new(Arc::clone(&client));

        let mut caches = HashMap::new();
        let mut table_names = Vec::new();
        for table in registry.cacheable_tables() {
            // fail fast on tables that could never load
            let info = registry.get_table_info(&table.name)?;
            let loader = Arc::new(TableLoader {
                info: Arc::clone(&info),
                simple: simple_dao.clone(),
                listing: listing_dao.clone(),
                compressing: compressing_dao.clone(),
            });
            let cache = LoadingCache::new(info.name.clone(), loader)
                .with_refresh_after_write(settings.refresh_after_write());
            table_names.push(info.name.clone());
            caches.insert(
                info.name.clone(),
                CacheInfo {
                    cache,
                    last_refreshed: AtomicI64::new(0),
                },
            );
        }

        let audit = AuditLogWriter::spawn(
            listing_dao.clone(),
            Arc::clone(&changed_keys),
            settings.audit_log_queue_size,
            settings.audit_log_workers,
            settings.changed_keys_time_window_ms,
        );

        info!(
            tables = table_names.len(),
            tick_ms = settings.tick_duration.as_millis() as u64,
            window_ms = settings.changed_keys_time_window_ms,
            "Cache manager created"
        );

        Ok(Arc::new(Self {
            client,
            registry,
            application_cache: ApplicationCache::new(settings.application_cache_enabled),
            settings,
            caches,
            table_names,
            refresh_lock: tokio::sync::Mutex::new(()),
            changed_keys,
            audit,
            simple_dao,
            listing_dao,
            compressing_dao,
            refresh_task: Mutex::new(None),
        }))
    }

    /// Build the manager, then precache every table and start the refresh
    /// task unless the client is a test client.
    pub async fn initialize(
        client: Arc<dyn DatabaseClient>,
        registry: Arc<TableRegistry>,
        settings: CacheSettings,
    ) -> XconfResult<Arc<Self>> {
        let manager = Self::new(client, registry, settings)?;
        if !manager.client.is_test_client() {
            let failed = manager.precache().await;
            if !failed.is_empty() {
                warn!(failed = ?failed, "Precaching incomplete, tables will load on demand");
            }
            manager.start_refresh_task()?;
        }
        Ok(manager)
    }

    /// [`CacheManager::initialize`] with settings read from the environment.
    pub async fn initialize_from_env(
        client: Arc<dyn DatabaseClient>,
        registry: Arc<TableRegistry>,
    ) -> XconfResult<Arc<Self>> {
        let settings = CacheSettings::from_env()?;
        Self::initialize(client, registry, settings).await
    }

    /// Load every cacheable table in parallel. Returns the tables that failed.
    pub async fn precache(self: &Arc<Self>) -> Vec<String> {
        let mut tasks = JoinSet::new();
        for table in &self.table_names {
            let manager = Arc::clone(self);
            let table = table.clone();
            tasks.spawn(async move {
                let result = manager.reload_table(&table).await;
                (table, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((table, Ok(count))) => debug!(table = %table, entries = count, "Table precached"),
                Ok((table, Err(e))) => {
                    error!(table = %table, error = %e, "Failed to precache table");
                    failed.push(table);
                }
                Err(e) => error!(error = %e, "Precache task panicked"),
            }
        }
        failed.sort();
        info!(
            tables = self.table_names.len(),
            failed = failed.len(),
            "Precaching completed"
        );
        failed
    }

    /// Start the background refresh task if it is not running.
    pub fn start_refresh_task(self: &Arc<Self>) -> XconfResult<()> {
        let mut slot = self
            .refresh_task
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        if slot.is_none() {
            *slot = Some(CacheRefreshTask::spawn(
                Arc::downgrade(self),
                self.settings.tick_duration,
                self.settings.retry_count_until_full_refresh,
                now_millis(),
            ));
        }
        Ok(())
    }

    pub fn refresh_task_metrics(&self) -> Option<CacheRefreshSnapshot> {
        self.refresh_task
            .lock()
            .ok()
            .and_then(|task| task.as_ref().map(CacheRefreshTask::metrics))
    }

    /// Stop the refresh task and drain the audit log.
    pub async fn shutdown(&self) {
        let task = self.refresh_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.stop().await;
        }
        self.audit.shutdown().await;
        info!("Cache manager shut down");
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn client(&self) -> &Arc<dyn DatabaseClient> {
        &self.client
    }

    pub fn application_cache(&self) -> &ApplicationCache {
        &self.application_cache
    }

    /// Names of the cached tables, sorted.
    pub fn cached_tables(&self) -> &[String] {
        &self.table_names
    }

    fn cache_info(&self, table: &str) -> XconfResult<&CacheInfo> {
        self.caches.get(table).ok_or_else(|| {
            if self.registry.contains(table) {
                RegistryError::TableNotCached {
                    table: table.to_string(),
                }
                .into()
            } else {
                RegistryError::TableNotRegistered {
                    table: table.to_string(),
                }
                .into()
            }
        })
    }

    /// Cache of a table configured for caching.
    pub fn cache(&self, table: &str) -> XconfResult<&LoadingCache> {
        self.cache_info(table).map(|info| &info.cache)
    }

    /// Cache of `table`, or `None` when the table is not cached.
    pub fn table_cache(&self, table: &str) -> Option<&LoadingCache> {
        self.caches.get(table).map(|info| &info.cache)
    }

    pub(crate) fn simple_dao(&self) -> &SimpleDao {
        &self.simple_dao
    }

    pub(crate) fn listing_dao(&self) -> &ListingDao {
        &self.listing_dao
    }

    pub(crate) fn compressing_dao(&self) -> &CompressingDataDao {
        &self.compressing_dao
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    pub fn cache_stats(&self, table: &str) -> XconfResult<CacheStats> {
        self.cache_info(table).map(|info| Self::stats_of(table, info))
    }

    /// Stats of every cached table, keyed by table name.
    pub fn statistics(&self) -> BTreeMap<String, CacheStats> {
        self.caches
            .iter()
            .map(|(table, info)| (table.clone(), Self::stats_of(table, info)))
            .collect()
    }

    fn stats_of(table: &str, info: &CacheInfo) -> CacheStats {
        let non_absent = info.cache.values().len();
        let last_refreshed = info
            .last_refreshed()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        CacheStats::from_snapshot(
            table,
            info.cache.counters().snapshot(),
            info.cache.size(),
            non_absent,
            last_refreshed,
        )
    }

    // ========================================================================
    // REFRESH
    // ========================================================================

    /// Reload every cached table. Returns the tables that failed.
    pub async fn refresh_all(&self) -> Vec<String> {
        let _guard = self.refresh_lock.lock().await;
        let mut failed = Vec::new();
        for table in &self.table_names {
            if let Err(e) = self.reload_table(table).await {
                error!(table = %table, error = %e, "Failed to refresh table cache");
                failed.push(table.clone());
            }
        }
        failed
    }

    /// Reload one cached table.
    pub async fn refresh(&self, table: &str) -> XconfResult<()> {
        self.cache_info(table)?;
        let _guard = self.refresh_lock.lock().await;
        self.reload_table(table).await.map(|_| ())
    }

    /// Load a table fully the first time a bulk read needs it.
    pub(crate) async fn ensure_loaded(&self, table: &str) -> XconfResult<()> {
        if self.cache_info(table)?.last_refreshed().is_none() {
            self.refresh(table).await?;
        }
        Ok(())
    }

    /// Bulk-load a table and swap it into its cache. Callers hold the refresh
    /// lock, except during precaching.
    async fn reload_table(&self, table: &str) -> XconfResult<usize> {
        let info = self.cache_info(table)?;
        let values = info.cache.load_all().await?;
        let count = values.len();
        info.cache.replace_all(values);
        info.last_refreshed.store(now_millis(), Ordering::Release);
        self.application_cache.delete_all(table);
        debug!(table = %table, entries = count, "Table cache reloaded");
        Ok(count)
    }

    // ========================================================================
    // SYNCHRONIZATION
    // ========================================================================

    /// Read the changed-keys log over `[start, end)` and optionally replay it.
    ///
    /// Buckets are scanned in ascending time order. Records that fail to
    /// decode are logged and skipped.
    pub async fn sync_changes(
        &self,
        start: TimestampMs,
        end: TimestampMs,
        apply: bool,
    ) -> XconfResult<Vec<ChangedData>> {
        let _guard = self.refresh_lock.lock().await;

        let mut records = Vec::new();
        for (bucket, range) in bucket_ranges(start, end, self.settings.changed_keys_time_window_ms) {
            let cells = self
                .listing_dao
                .get_range(&self.changed_keys, &bucket.to_string(), &range)
                .await?;
            for (column, bytes) in cells {
                match ChangedData::from_json(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(bucket, column = %column, error = %e, "Skipping undecodable changed-keys record")
                    }
                }
            }
        }

        debug!(start, end, records = records.len(), "Changed keys scanned");
        if apply && !records.is_empty() {
            self.apply_changes_locked(&records).await?;
        }
        Ok(records)
    }

    /// Replay a batch of changed-keys records against the local caches.
    pub async fn apply_changes(&self, records: &[ChangedData]) -> XconfResult<()> {
        let _guard = self.refresh_lock.lock().await;
        self.apply_changes_locked(records).await
    }

    async fn apply_changes_locked(&self, records: &[ChangedData]) -> XconfResult<()> {
        let mut refresh_candidates = BTreeSet::new();
        let mut touched = BTreeSet::new();

        let result = self
            .replay(records, &mut refresh_candidates, &mut touched)
            .await;

        // candidates gathered before an abort are still reloaded
        for table in &refresh_candidates {
            if let Err(e) = self.reload_table(table).await {
                error!(table = %table, error = %e, "Failed to reload drifted table");
            }
        }
        for table in &touched {
            self.application_cache.delete_all(table);
        }
        result
    }

    async fn replay(
        &self,
        records: &[ChangedData],
        refresh_candidates: &mut BTreeSet<String>,
        touched: &mut BTreeSet<String>,
    ) -> XconfResult<()> {
        for record in records {
            if let Some(field) = record.missing_field() {
                warn!(field, column = %record.column_name, "Skipping changed-keys record with missing field");
                continue;
            }
            let table = record.cf_name.as_str();
            let info = self.registry.get_table_info(table)?;
            if record.dao_id != info.dao_id {
                warn!(
                    table = %table,
                    expected = ?info.dao_id,
                    found = ?record.dao_id,
                    "DAO id mismatch in changed-keys record"
                );
            }
            let Some(cache_info) = self.caches.get(table) else {
                debug!(table = %table, "Changed-keys record for uncached table");
                continue;
            };
            let cache = &cache_info.cache;
            let key = record.normalized_key();
            touched.insert(table.to_string());

            match record.operation {
                Some(ChangeOperation::Create) | Some(ChangeOperation::Update) => {
                    cache.refresh(key).await?;
                    cache.get(key).await?;
                }
                Some(ChangeOperation::Delete) => {
                    cache.invalidate(key);
                }
                Some(ChangeOperation::TruncateCf) => {
                    cache.invalidate_all();
                    info!(table = %table, "Table cache truncated by changed-keys record");
                    break;
                }
                None => continue,
            }

            let size = cache.size();
            if size < record.valid_cache_size && refresh_candidates.insert(table.to_string()) {
                warn!(
                    table = %table,
                    size,
                    expected = record.valid_cache_size,
                    "Cache size below writer's size, scheduling reload"
                );
            }
        }
        Ok(())
    }

    // ========================================================================
    // AUDIT LOG
    // ========================================================================

    /// Append a changed-keys record asynchronously. Never fails the caller;
    /// returns false when the record was dropped.
    pub fn write_cache_log(
        &self,
        table: &str,
        key: &str,
        operation: ChangeOperation,
        cache_size_after: usize,
    ) -> bool {
        let dao_id = self
            .registry
            .get_table_info(table)
            .ok()
            .and_then(|info| info.dao_id)
            .or_else(|| dao_id_for(table))
            .unwrap_or_default();
        let record = ChangedData::new(
            table,
            key,
            operation,
            dao_id,
            cache_size_after,
            self.settings.audit_user_name.as_str(),
        );
        self.audit.submit(record)
    }

    /// Wait until queued audit records have been written.
    pub async fn wait_for_audit_log(&self) {
        self.audit.wait_idle().await;
    }

    pub fn audit_metrics(&self) -> AuditLogSnapshot {
        self.audit.metrics()
    }
}

#[async_trait]
impl CacheSynchronizer for CacheManager {
    async fn full_refresh(&self) -> Vec<String> {
        self.refresh_all().await
    }

    async fn incremental_sync(&self, start: TimestampMs, end: TimestampMs) -> XconfResult<()> {
        self.sync_changes(start, end, true).await.map(|_| ())
    }
}
