//! Asynchronous changed-keys audit log writer.
//!
//! Cache-backed writes hand a [`ChangedData`] record to the writer and return
//! immediately. A bounded queue feeds a fixed pool of worker tasks that append
//! each record to the changed-keys table under its time bucket. Failures are
//! logged and counted, never surfaced to the writer. When the queue is full
//! the record is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use xconf_core::identity::timestamp_of;
use xconf_core::{bucket_of, now_millis, ChangedData, TimestampMs};

use crate::dao::ListingDao;
use crate::registry::TableInfo;

#[derive(Debug)]
struct AuditJob {
    bucket: TimestampMs,
    record: ChangedData,
}

/// Counters of the audit log writer.
#[derive(Debug, Default)]
pub struct AuditLogMetrics {
    /// Records accepted into the queue
    pub queued: AtomicU64,
    /// Records appended to the log
    pub written: AtomicU64,
    /// Records whose append failed
    pub failed: AtomicU64,
    /// Records rejected because the queue was full or closed
    pub dropped: AtomicU64,
    /// Records accepted but not yet processed
    pub pending: AtomicU64,
}

impl AuditLogMetrics {
    pub fn snapshot(&self) -> AuditLogSnapshot {
        AuditLogSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditLogSnapshot {
    pub queued: u64,
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
    pub pending: u64,
}

pub struct AuditLogWriter {
    sender: Mutex<Option<mpsc::Sender<AuditJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<AuditLogMetrics>,
    idle: Arc<Notify>,
    window_ms: i64,
}

impl AuditLogWriter {
    /// Start the worker pool. Must be called within a Tokio runtime.
    pub fn spawn(
        dao: ListingDao,
        table: Arc<TableInfo>,
        queue_size: usize,
        worker_count: usize,
        window_ms: i64,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let metrics = Arc::new(AuditLogMetrics::default());
        let idle = Arc::new(Notify::new());

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    dao.clone(),
                    Arc::clone(&table),
                    Arc::clone(&rx),
                    Arc::clone(&metrics),
                    Arc::clone(&idle),
                ))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            metrics,
            idle,
            window_ms,
        }
    }

    /// Enqueue a record. Returns false when it was dropped.
    pub fn submit(&self, record: ChangedData) -> bool {
        let ts = timestamp_of(&record.column_name).unwrap_or_else(now_millis);
        let job = AuditJob {
            bucket: bucket_of(ts, self.window_ms),
            record,
        };

        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(table = %job.record.cf_name, key = %job.record.changed_key, "Audit log closed, record dropped");
            return false;
        };

        self.metrics.pending.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(job) {
            Ok(()) => {
                self.metrics.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                finish_one(&self.metrics, &self.idle);
                let job = match e {
                    mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
                };
                warn!(
                    table = %job.record.cf_name,
                    key = %job.record.changed_key,
                    operation = %job.record.operation.map(|op| op.as_str()).unwrap_or("?"),
                    "Audit log queue unavailable, record dropped"
                );
                false
            }
        }
    }

    pub fn metrics(&self) -> AuditLogSnapshot {
        self.metrics.snapshot()
    }

    /// Wait until every accepted record has been processed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.metrics.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Close the queue, drain it and wait for the workers to exit.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Audit log worker panicked");
            }
        }
    }
}

fn finish_one(metrics: &AuditLogMetrics, idle: &Notify) {
    if metrics.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        idle.notify_waiters();
    }
}

async fn run_worker(
    worker: usize,
    dao: ListingDao,
    table: Arc<TableInfo>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AuditJob>>>,
    metrics: Arc<AuditLogMetrics>,
    idle: Arc<Notify>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let bucket = job.bucket.to_string();
        match dao
            .set_one(&table, &bucket, &job.record.column_name, &job.record)
            .await
        {
            Ok(()) => {
                metrics.written.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    worker,
                    bucket = job.bucket,
                    table = %job.record.cf_name,
                    key = %job.record.changed_key,
                    "Audit record written"
                );
            }
            Err(e) => {
                metrics.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker,
                    error = %e,
                    table = %job.record.cf_name,
                    key = %job.record.changed_key,
                    "Failed to write audit record"
                );
            }
        }
        finish_one(&metrics, &idle);
    }
    debug!(worker, "Audit log worker stopped");
}
