//! Background cache reconciliation task.
//!
//! Every tick the task either replays the changed-keys log since the last
//! successful pass (incremental sync) or, once the retry budget is exhausted,
//! reloads every table (full refresh). A successful pass of either kind
//! restores the budget and advances the sync watermark; a failed incremental
//! sync spends one retry; a failed full refresh is retried next tick.
//!
//! # Shutdown
//!
//! [`CacheRefreshTask::stop`] signals a watch channel and awaits the task. A
//! tick already in flight completes before the signal is observed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use xconf_core::{now_millis, TimestampMs, XconfResult};

/// Reconciliation operations driven by the refresh task.
#[async_trait]
pub trait CacheSynchronizer: Send + Sync {
    /// Reload every cacheable table. Returns the tables that failed.
    async fn full_refresh(&self) -> Vec<String>;

    /// Replay the changed-keys log over `[start, end)`.
    async fn incremental_sync(&self, start: TimestampMs, end: TimestampMs) -> XconfResult<()>;
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Synced,
    SyncFailed { retries_left: u32 },
    FullRefreshed,
    FullRefreshFailed { failed_tables: Vec<String> },
}

/// Retry budget and sync watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshState {
    retries_left: u32,
    max_retries: u32,
    last_refreshed: TimestampMs,
}

impl RefreshState {
    pub fn new(max_retries: u32, last_refreshed: TimestampMs) -> Self {
        Self {
            retries_left: max_retries,
            max_retries,
            last_refreshed,
        }
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn last_refreshed(&self) -> TimestampMs {
        self.last_refreshed
    }

    /// Run one reconciliation step at time `now`.
    pub async fn tick<S>(&mut self, target: &S, now: TimestampMs) -> TickOutcome
    where
        S: CacheSynchronizer + ?Sized,
    {
        if self.retries_left == 0 {
            let failed_tables = target.full_refresh().await;
            if failed_tables.is_empty() {
                self.retries_left = self.max_retries;
                self.last_refreshed = now;
                tracing::info!("Full cache refresh completed");
                TickOutcome::FullRefreshed
            } else {
                tracing::error!(failed = ?failed_tables, "Full cache refresh failed");
                TickOutcome::FullRefreshFailed { failed_tables }
            }
        } else {
            match target.incremental_sync(self.last_refreshed, now).await {
                Ok(()) => {
                    tracing::debug!(start = self.last_refreshed, end = now, "Cache sync completed");
                    self.last_refreshed = now;
                    self.retries_left = self.max_retries;
                    TickOutcome::Synced
                }
                Err(e) => {
                    self.retries_left -= 1;
                    tracing::error!(
                        error = %e,
                        retries_left = self.retries_left,
                        "Cache sync failed"
                    );
                    TickOutcome::SyncFailed {
                        retries_left: self.retries_left,
                    }
                }
            }
        }
    }
}

/// Counters of the refresh task.
#[derive(Debug, Default)]
pub struct CacheRefreshMetrics {
    pub ticks: AtomicU64,
    pub syncs_succeeded: AtomicU64,
    pub syncs_failed: AtomicU64,
    pub full_refreshes_succeeded: AtomicU64,
    pub full_refreshes_failed: AtomicU64,
}

impl CacheRefreshMetrics {
    fn record(&self, outcome: &TickOutcome) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            TickOutcome::Synced => &self.syncs_succeeded,
            TickOutcome::SyncFailed { .. } => &self.syncs_failed,
            TickOutcome::FullRefreshed => &self.full_refreshes_succeeded,
            TickOutcome::FullRefreshFailed { .. } => &self.full_refreshes_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheRefreshSnapshot {
        CacheRefreshSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            syncs_succeeded: self.syncs_succeeded.load(Ordering::Relaxed),
            syncs_failed: self.syncs_failed.load(Ordering::Relaxed),
            full_refreshes_succeeded: self.full_refreshes_succeeded.load(Ordering::Relaxed),
            full_refreshes_failed: self.full_refreshes_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheRefreshSnapshot {
    pub ticks: u64,
    pub syncs_succeeded: u64,
    pub syncs_failed: u64,
    pub full_refreshes_succeeded: u64,
    pub full_refreshes_failed: u64,
}

/// Handle to the running refresh task.
pub struct CacheRefreshTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    metrics: Arc<CacheRefreshMetrics>,
}

impl CacheRefreshTask {
    /// Start ticking every `tick` against `target`.
    ///
    /// The task holds only a weak reference and exits once the target is
    /// dropped. The first tick fires one full period after spawning.
    pub fn spawn<S>(target: Weak<S>, tick: Duration, max_retries: u32, last_refreshed: TimestampMs) -> Self
    where
        S: CacheSynchronizer + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(CacheRefreshMetrics::default());
        let state = RefreshState::new(max_retries, last_refreshed);
        let handle = tokio::spawn(run(target, tick, state, shutdown_rx, Arc::clone(&metrics)));

        Self {
            shutdown_tx,
            handle,
            metrics,
        }
    }

    pub fn metrics(&self) -> CacheRefreshSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Cache refresh task panicked");
        }
    }
}

async fn run<S>(
    target: Weak<S>,
    tick: Duration,
    mut state: RefreshState,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<CacheRefreshMetrics>,
) where
    S: CacheSynchronizer + 'static,
{
    let mut ticker = interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        tick_ms = tick.as_millis() as u64,
        max_retries = state.max_retries,
        "Cache refresh task started"
    );

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let Some(target) = target.upgrade() else {
                    tracing::debug!("Cache manager dropped, refresh task exiting");
                    break;
                };
                let outcome = state.tick(target.as_ref(), now_millis()).await;
                metrics.record(&outcome);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        ticks = snapshot.ticks,
        syncs_failed = snapshot.syncs_failed,
        full_refreshes = snapshot.full_refreshes_succeeded,
        "Cache refresh task stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use xconf_core::XconfError;

    /// Scripted synchronizer recording every call.
    #[derive(Default)]
    struct Scripted {
        sync_results: Mutex<VecDeque<bool>>,
        refresh_results: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with(syncs: &[bool], refreshes: &[bool]) -> Self {
            Self {
                sync_results: Mutex::new(syncs.iter().copied().collect()),
                refresh_results: Mutex::new(refreshes.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CacheSynchronizer for Scripted {
        async fn full_refresh(&self) -> Vec<String> {
            self.calls.lock().unwrap().push("full".to_string());
            let ok = self.refresh_results.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                Vec::new()
            } else {
                vec!["Model".to_string()]
            }
        }

        async fn incremental_sync(&self, start: TimestampMs, end: TimestampMs) -> XconfResult<()> {
            self.calls.lock().unwrap().push(format!("sync {}..{}", start, end));
            let ok = self.sync_results.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(XconfError::backend("XconfChangedKeys4", "timeout"))
            }
        }
    }

    #[tokio::test]
    async fn test_success_advances_watermark() {
        let target = Scripted::default();
        let mut state = RefreshState::new(3, 100);

        assert_eq!(state.tick(&target, 200).await, TickOutcome::Synced);
        assert_eq!(state.tick(&target, 300).await, TickOutcome::Synced);
        assert_eq!(state.last_refreshed(), 300);
        assert_eq!(target.calls(), vec!["sync 100..200", "sync 200..300"]);
    }

    #[tokio::test]
    async fn test_failures_spend_budget_then_full_refresh() {
        let target = Scripted::with(&[false, false], &[]);
        let mut state = RefreshState::new(2, 100);

        assert_eq!(
            state.tick(&target, 200).await,
            TickOutcome::SyncFailed { retries_left: 1 }
        );
        assert_eq!(
            state.tick(&target, 300).await,
            TickOutcome::SyncFailed { retries_left: 0 }
        );
        // failed syncs keep the watermark so the window is retried
        assert_eq!(state.last_refreshed(), 100);

        assert_eq!(state.tick(&target, 400).await, TickOutcome::FullRefreshed);
        assert_eq!(state.retries_left(), 2);
        assert_eq!(state.last_refreshed(), 400);
        assert_eq!(
            target.calls(),
            vec!["sync 100..200", "sync 100..300", "full"]
        );
    }

    #[tokio::test]
    async fn test_failed_full_refresh_retried_next_tick() {
        let target = Scripted::with(&[false], &[false, true]);
        let mut state = RefreshState::new(1, 0);

        state.tick(&target, 10).await;
        assert_eq!(
            state.tick(&target, 20).await,
            TickOutcome::FullRefreshFailed {
                failed_tables: vec!["Model".to_string()]
            }
        );
        assert_eq!(state.retries_left(), 0);
        assert_eq!(state.tick(&target, 30).await, TickOutcome::FullRefreshed);
        assert_eq!(state.retries_left(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_budget() {
        let target = Scripted::with(&[false, true, false], &[]);
        let mut state = RefreshState::new(2, 0);

        state.tick(&target, 10).await;
        assert_eq!(state.retries_left(), 1);
        state.tick(&target, 20).await;
        assert_eq!(state.retries_left(), 2);
        state.tick(&target, 30).await;
        assert_eq!(state.retries_left(), 1);
    }

    #[tokio::test]
    async fn test_task_ticks_and_stops() {
        let target = Arc::new(Scripted::default());
        let task = CacheRefreshTask::spawn(
            Arc::downgrade(&target),
            Duration::from_millis(10),
            3,
            now_millis(),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(task.metrics().ticks >= 1);
        assert!(!task.is_finished());

        task.stop().await;
        let ticks_after_stop = target.calls().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(target.calls().len(), ticks_after_stop);
    }

    #[tokio::test]
    async fn test_task_exits_when_target_dropped() {
        let target = Arc::new(Scripted::default());
        let task = CacheRefreshTask::spawn(
            Arc::downgrade(&target),
            Duration::from_millis(5),
            3,
            now_millis(),
        );
        drop(target);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(task.is_finished());
        task.stop().await;
    }
}
