//! Cross-Instance Cache Synchronization Tests
//!
//! Two managers sharing one in-memory store stand in for two service
//! instances. Writes go through one instance's cached DAOs; the other
//! converges by scanning the changed-keys log.

use std::sync::Arc;
use std::time::Duration;

use xconf_core::constants::dao_id_for;
use xconf_core::now_millis;
use xconf_storage::{CachedListingDao, CachedSimpleDao, DatabaseClient};
use xconf_test_utils::assertions::*;
use xconf_test_utils::fixtures::*;
use xconf_test_utils::*;

// ============================================================================
// HELPERS
// ============================================================================

struct Instance {
    manager: Arc<CacheManager>,
    simple: CachedSimpleDao,
    listing: CachedListingDao,
}

impl Instance {
    fn new(client: &Arc<InMemoryDatabaseClient>) -> Self {
        let manager = test_manager(Arc::clone(client), test_settings());
        Self {
            simple: CachedSimpleDao::new(Arc::clone(&manager)),
            listing: CachedListingDao::new(Arc::clone(&manager)),
            manager,
        }
    }
}

/// A sync window start strictly after every record written so far.
async fn mark() -> i64 {
    tokio::time::sleep(Duration::from_millis(3)).await;
    now_millis()
}

async fn sync(instance: &Instance, since: i64) -> Vec<ChangedData> {
    instance
        .manager
        .sync_changes(since, now_millis() + 1, true)
        .await
        .unwrap()
}

fn record(table: &str, key: &str, op: ChangeOperation, size: usize) -> ChangedData {
    ChangedData::new(table, key, op, dao_id_for(table).unwrap(), size, "other-host")
}

// ============================================================================
// SINGLE INSTANCE
// ============================================================================

#[tokio::test]
async fn test_write_through_and_read_through() {
    init_test_tracing();
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);

    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    let reads = client.read_count();
    assert_eq!(*a.simple.get_one::<Model>(TABLE_MODEL, "m1").await.unwrap(), Model::new("m1"));
    assert_eq!(client.read_count(), reads, "cached read must not touch the store");

    a.manager.wait_for_audit_log().await;
    let audit = a.manager.audit_metrics();
    assert_eq!(audit.written, 1);
    assert_eq!(audit.dropped, 0);
}

#[tokio::test]
async fn test_single_instance_set_get_delete() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);

    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    assert_eq!(a.manager.cache(TABLE_MODEL).unwrap().size(), 1);
    assert_eq!(*a.simple.get_one::<Model>(TABLE_MODEL, "m1").await.unwrap(), Model::new("m1"));

    a.simple.delete_one(TABLE_MODEL, "m1").await.unwrap();
    assert_not_found(&client.get_one(TABLE_MODEL, "m1").await);
}

#[tokio::test]
async fn test_delete_then_cache_read_skips_store() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    a.simple.delete_one(TABLE_MODEL, "m1").await.unwrap();

    let reads = client.read_count();
    assert_not_found(&a.simple.get_one_from_cache_only::<Model>(TABLE_MODEL, "m1"));
    assert_eq!(client.read_count(), reads);
    assert_not_found(&a.simple.get_one::<Model>(TABLE_MODEL, "m1").await);
}

#[tokio::test]
async fn test_store_failure_leaves_cache_and_log_untouched() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    client.set_table_failing(TABLE_MODEL, true);

    let result = a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await;
    assert_backend_error(&result);
    assert!(!a.manager.cache(TABLE_MODEL).unwrap().contains("m1"));

    a.manager.wait_for_audit_log().await;
    assert_eq!(a.manager.audit_metrics().queued, 0);
}

#[tokio::test]
async fn test_application_cache_dropped_on_write() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let app = a.manager.application_cache();
    app.set(TABLE_MODEL, "derived", 42u32);
    app.set(TABLE_ENVIRONMENT, "derived", 7u32);

    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    assert!(app.get::<u32>(TABLE_MODEL, "derived").is_none());
    assert_eq!(app.get::<u32>(TABLE_ENVIRONMENT, "derived").as_deref(), Some(&7));
}

#[tokio::test]
async fn test_compressed_table_through_cached_dao() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let big = NamedList::new("macs", 20_000);

    a.simple.set_one(TABLE_NAMED_LIST, "macs", big.clone()).await.unwrap();
    assert!(client.row_len(TABLE_NAMED_LIST, "macs") >= 2);

    a.manager.refresh(TABLE_NAMED_LIST).await.unwrap();
    let loaded = a.simple.get_one::<NamedList>(TABLE_NAMED_LIST, "macs").await.unwrap();
    assert_eq!(*loaded, big);

    a.simple.set_one(TABLE_NAMED_LIST, "macs", NamedList::new("macs", 1)).await.unwrap();
    a.manager.refresh(TABLE_NAMED_LIST).await.unwrap();
    assert_eq!(
        a.simple
            .get_one::<NamedList>(TABLE_NAMED_LIST, "macs")
            .await
            .unwrap()
            .data
            .len(),
        1
    );
}

// ============================================================================
// TWO INSTANCES
// ============================================================================

#[tokio::test]
async fn test_second_instance_converges_on_create_update_delete() {
    init_test_tracing();
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);

    let since = mark().await;
    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    a.manager.wait_for_audit_log().await;
    let seen = sync(&b, since).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].operation, Some(ChangeOperation::Create));
    assert_eq!(
        *b.simple.get_one_from_cache_only::<Model>(TABLE_MODEL, "m1").unwrap(),
        Model::new("m1")
    );

    let since = mark().await;
    let mut updated = Model::new("m1");
    updated.description = "updated".to_string();
    a.simple.set_one(TABLE_MODEL, "m1", updated.clone()).await.unwrap();
    a.manager.wait_for_audit_log().await;
    let seen = sync(&b, since).await;
    assert_eq!(seen[0].operation, Some(ChangeOperation::Update));
    assert_eq!(
        *b.simple.get_one_from_cache_only::<Model>(TABLE_MODEL, "m1").unwrap(),
        updated
    );

    let since = mark().await;
    a.simple.delete_one(TABLE_MODEL, "m1").await.unwrap();
    a.manager.wait_for_audit_log().await;
    sync(&b, since).await;
    assert_not_found(&b.simple.get_one_from_cache_only::<Model>(TABLE_MODEL, "m1"));
}

#[tokio::test]
async fn test_second_instance_converges_on_listing_rows() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);

    let since = mark().await;
    for id in ["f1", "f2"] {
        a.listing
            .set_one(TABLE_LOG_FILE_LIST, "settings-1", id, LogFile::new(id))
            .await
            .unwrap();
    }
    a.manager.wait_for_audit_log().await;
    assert_eq!(sync(&b, since).await.len(), 2);

    let cached = b
        .listing
        .get_one_from_cache_only::<LogFile>(TABLE_LOG_FILE_LIST, "settings-1", "f2")
        .unwrap();
    assert_eq!(*cached, LogFile::new("f2"));
}

#[tokio::test]
async fn test_scan_without_apply_leaves_caches_alone() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);

    let since = mark().await;
    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    a.manager.wait_for_audit_log().await;

    let seen = b.manager.sync_changes(since, now_millis() + 1, false).await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(b.manager.cache(TABLE_MODEL).unwrap().size(), 0);
}

// ============================================================================
// REPLAY SEMANTICS
// ============================================================================

#[tokio::test]
async fn test_truncate_stops_the_batch() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);
    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    a.simple.set_one(TABLE_MODEL, "m2", Model::new("m2")).await.unwrap();

    let batch = vec![
        record(TABLE_MODEL, "m1", ChangeOperation::Create, 1),
        record(TABLE_MODEL, TABLE_MODEL, ChangeOperation::TruncateCf, 0),
        record(TABLE_MODEL, "m2", ChangeOperation::Create, 1),
    ];

    b.manager.apply_changes(&batch).await.unwrap();
    let cache = b.manager.cache(TABLE_MODEL).unwrap();
    assert_eq!(cache.size(), 0, "records after a truncate are not replayed");
}

#[tokio::test]
async fn test_size_drift_reloads_table_once() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);
    for id in ["m1", "m2", "m3"] {
        a.simple.set_one(TABLE_MODEL, id, Model::new(id)).await.unwrap();
    }

    let batch = vec![
        record(TABLE_MODEL, "m1", ChangeOperation::Update, 3),
        record(TABLE_MODEL, "m2", ChangeOperation::Update, 3),
    ];
    b.manager.apply_changes(&batch).await.unwrap();

    let stats = b.manager.cache_stats(TABLE_MODEL).unwrap();
    assert_eq!(stats.size, 3);
    assert!(stats.last_refreshed.is_some());
    // two key loads and a single bulk reload
    assert_eq!(stats.load_success_count, 3);
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);
    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    a.simple.set_one(TABLE_MODEL, "m2", Model::new("m2")).await.unwrap();
    a.simple.delete_one(TABLE_MODEL, "m2").await.unwrap();

    let batch = vec![
        record(TABLE_MODEL, "m1", ChangeOperation::Create, 1),
        record(TABLE_MODEL, "m2", ChangeOperation::Delete, 1),
    ];
    b.manager.apply_changes(&batch).await.unwrap();
    let mut first = b.manager.cache(TABLE_MODEL).unwrap().keys();
    b.manager.apply_changes(&batch).await.unwrap();
    let mut second = b.manager.cache(TABLE_MODEL).unwrap().keys();
    first.sort();
    second.sort();
    assert_eq!(first, vec!["m1".to_string()]);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_unknown_table_aborts_replay() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let b = Instance::new(&client);
    let mut bogus = record(TABLE_MODEL, "m1", ChangeOperation::Create, 1);
    bogus.cf_name = "NoSuchTable".to_string();

    assert_not_found(&b.manager.apply_changes(&[bogus]).await);
}

#[tokio::test]
async fn test_drifted_table_reloaded_even_when_batch_aborts() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);
    for id in ["m1", "m2", "m3"] {
        a.simple.set_one(TABLE_MODEL, id, Model::new(id)).await.unwrap();
    }

    let mut bogus = record(TABLE_MODEL, "x", ChangeOperation::Create, 1);
    bogus.cf_name = "NoSuchTable".to_string();
    let batch = vec![record(TABLE_MODEL, "m1", ChangeOperation::Update, 3), bogus];

    assert_not_found(&b.manager.apply_changes(&batch).await);
    let stats = b.manager.cache_stats(TABLE_MODEL).unwrap();
    assert!(stats.last_refreshed.is_some());
    assert_eq!(stats.size, 3);
}

#[tokio::test]
async fn test_dao_id_mismatch_still_applies() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);
    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();

    let mut drifted = record(TABLE_MODEL, "m1", ChangeOperation::Create, 1);
    drifted.dao_id = Some(42);
    b.manager.apply_changes(&[drifted]).await.unwrap();
    assert_eq!(
        *b.simple.get_one_from_cache_only::<Model>(TABLE_MODEL, "m1").unwrap(),
        Model::new("m1")
    );
}

#[tokio::test]
async fn test_records_for_uncached_tables_are_ignored() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let b = Instance::new(&client);
    let batch = vec![record(TABLE_ENVIRONMENT, "e1", ChangeOperation::Create, 1)];
    b.manager.apply_changes(&batch).await.unwrap();
    assert_eq!(client.read_count(), 0);
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_precache_and_refresh_task() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();

    let b = Instance::new(&client);
    assert!(b.manager.precache().await.is_empty());
    assert_eq!(b.manager.cache(TABLE_MODEL).unwrap().size(), 1);

    b.manager.start_refresh_task().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let metrics = b.manager.refresh_task_metrics().unwrap();
    assert!(metrics.ticks >= 1);
    assert_eq!(metrics.syncs_failed, 0);

    b.manager.shutdown().await;
    assert!(b.manager.refresh_task_metrics().is_none());
}

#[tokio::test]
async fn test_refresh_task_picks_up_remote_writes() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    let b = Instance::new(&client);
    b.manager.start_refresh_task().unwrap();

    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    a.manager.wait_for_audit_log().await;

    let mut converged = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if b.manager.cache(TABLE_MODEL).unwrap().contains("m1") {
            converged = true;
            break;
        }
    }
    assert!(converged, "refresh task did not replay the remote write");
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_statistics_cover_cached_tables() {
    let client = Arc::new(InMemoryDatabaseClient::new());
    let a = Instance::new(&client);
    a.simple.set_one(TABLE_MODEL, "m1", Model::new("m1")).await.unwrap();
    a.simple.get_one::<Model>(TABLE_MODEL, "m1").await.unwrap();

    let stats = a.manager.statistics();
    assert_eq!(stats.len(), 3);
    let mut tables = a.manager.cached_tables().to_vec();
    tables.sort();
    assert_eq!(stats.keys().cloned().collect::<Vec<_>>(), tables);
    assert_eq!(stats[TABLE_MODEL].hit_count, 1);
    assert_not_cached(&a.manager.cache_stats(TABLE_ENVIRONMENT));
}
