//! Wires the store, queue, recorders, reconciler and network monitor together
//! and runs the background sync loop.
//!
//! The loop drains the queue whenever connectivity comes back and on every
//! interval tick while online. With `probe_interval_secs` configured it also
//! asks the table service whether it is reachable and feeds the answer into
//! the network monitor.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::ResponseCache;
use crate::config::{RemoteConfig, SyncConfig};
use crate::db;
use crate::error::{StoreError, SyncError};
use crate::network::NetworkMonitor;
use crate::queue::SyncQueue;
use crate::reconciler::{SyncReconciler, SyncReport};
use crate::recorder::{OfflineLedger, OfflineSaleRecorder, PendingCounts};
use crate::remote::{RemoteTables, RestClient};
use crate::sale::{GiftSale, SaleIdGenerator, StationeryDailySale, StationerySale};
use crate::store::LocalStore;

pub struct SyncRuntime<R: RemoteTables> {
    config: SyncConfig,
    queue: SyncQueue,
    stationery: Arc<OfflineSaleRecorder<StationerySale>>,
    gifts: Arc<OfflineSaleRecorder<GiftSale>>,
    stationery_daily: Arc<OfflineSaleRecorder<StationeryDailySale>>,
    reconciler: SyncReconciler<R>,
    remote: Arc<R>,
    network: NetworkMonitor,
    cache: ResponseCache,
    last_sync: Mutex<Option<String>>,
    loop_token: Mutex<Option<CancellationToken>>,
}

impl SyncRuntime<RestClient> {
    /// Open the on-disk store under `config.data_dir` and connect to the
    /// table service.
    pub fn open(
        config: SyncConfig,
        remote: RemoteConfig,
        initially_online: bool,
    ) -> Result<Self, SyncError> {
        let db_state = db::init(&config.data_dir).map_err(StoreError::Backend)?;
        let store = LocalStore::sqlite(Arc::new(db_state));
        let client = RestClient::new(
            remote,
            config.request_timeout(),
            config.upsert_on_client_ref,
        )?;
        Ok(Self::with_store(config, store, client, initially_online))
    }
}

impl<R: RemoteTables> SyncRuntime<R> {
    pub fn with_store(
        config: SyncConfig,
        store: LocalStore,
        remote: R,
        initially_online: bool,
    ) -> Self {
        let queue = SyncQueue::new(store.clone());
        let ids = Arc::new(SaleIdGenerator::new());
        let stationery = Arc::new(OfflineSaleRecorder::new(
            store.clone(),
            queue.clone(),
            ids.clone(),
        ));
        let gifts = Arc::new(OfflineSaleRecorder::new(
            store.clone(),
            queue.clone(),
            ids.clone(),
        ));
        let stationery_daily =
            Arc::new(OfflineSaleRecorder::new(store.clone(), queue.clone(), ids));
        let cache = ResponseCache::new(store, &config.cache_version);

        let remote = Arc::new(remote);
        let ledgers: Vec<Arc<dyn OfflineLedger>> = vec![
            stationery.clone(),
            gifts.clone(),
            stationery_daily.clone(),
        ];
        let reconciler =
            SyncReconciler::new(queue.clone(), remote.clone(), ledgers, config.clear_policy);

        Self {
            config,
            queue,
            stationery,
            gifts,
            stationery_daily,
            reconciler,
            remote,
            network: NetworkMonitor::new(initially_online),
            cache,
            last_sync: Mutex::new(None),
            loop_token: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stationery(&self) -> &OfflineSaleRecorder<StationerySale> {
        &self.stationery
    }

    pub fn gifts(&self) -> &OfflineSaleRecorder<GiftSale> {
        &self.gifts
    }

    pub fn stationery_daily(&self) -> &OfflineSaleRecorder<StationeryDailySale> {
        &self.stationery_daily
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn reconciler(&self) -> &SyncReconciler<R> {
        &self.reconciler
    }

    /// App-shell response cache, versioned by `cache_version`.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            stationery: self.stationery.pending_count(),
            gift: self.gifts.pending_count(),
            stationery_daily: self.stationery_daily.pending_count(),
        }
    }

    pub fn last_sync(&self) -> Option<String> {
        self.last_sync.lock().ok().and_then(|g| g.clone())
    }

    fn mark_synced(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
    }

    /// Drain every category now. Refused while offline.
    pub async fn force_sync(&self) -> Result<Vec<SyncReport>, SyncError> {
        if !self.network.is_online() {
            return Err(SyncError::Offline);
        }
        let reports = self.reconciler.sync_all().await?;
        self.mark_synced();
        let synced: usize = reports.iter().map(|r| r.synced).sum();
        info!("Force sync complete: {synced} items synced");
        Ok(reports)
    }

    /// Snapshot for status indicators.
    pub fn status(&self) -> Value {
        let counts = self.pending_counts();
        json!({
            "isOnline": self.network.is_online(),
            "isSyncing": self.reconciler.is_syncing(),
            "pendingTotal": counts.total(),
            "pending": counts,
            "queueLength": self.queue.len(),
            "lastSync": self.last_sync(),
            "clearPolicy": self.reconciler.policy(),
            "loopRunning": self.is_loop_running(),
        })
    }

    pub fn is_loop_running(&self) -> bool {
        self.loop_token
            .lock()
            .map(|g| g.as_ref().map(|t| !t.is_cancelled()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Stop the background loop if it is running.
    pub fn stop_sync_loop(&self) {
        if let Ok(mut guard) = self.loop_token.lock() {
            if let Some(token) = guard.take() {
                token.cancel();
                info!("Sync loop stop requested");
            }
        }
    }

    async fn run_cycle(&self, reason: &str) {
        match self.reconciler.sync_all().await {
            Ok(reports) => {
                let synced: usize = reports.iter().map(|r| r.synced).sum();
                let failed: usize = reports.iter().map(|r| r.failed).sum();
                if synced > 0 || failed > 0 {
                    info!(reason, synced, failed, "Sync cycle complete");
                }
                self.mark_synced();
            }
            Err(e) => warn!(reason, error = %e, "Sync cycle failed"),
        }
    }
}

impl<R: RemoteTables> SyncRuntime<R> {
    /// Spawn the background loop on the current tokio runtime.
    pub fn start_sync_loop(self: &Arc<Self>) -> Result<(), SyncError> {
        let token = {
            let mut guard = self
                .loop_token
                .lock()
                .map_err(|_| SyncError::Store(StoreError::Poisoned))?;
            if guard.as_ref().map(|t| !t.is_cancelled()).unwrap_or(false) {
                return Err(SyncError::AlreadyRunning);
            }
            let token = CancellationToken::new();
            *guard = Some(token.clone());
            token
        };

        let runtime = Arc::clone(self);
        let interval = self.config.sync_interval();
        let probe_every = self.config.probe_interval_secs.map(Duration::from_secs);

        tokio::spawn(async move {
            info!("Sync loop started (interval: {}s)", interval.as_secs());
            let mut network = runtime.network.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut probe_ticker = probe_every.map(|every| {
                let mut t = tokio::time::interval(every);
                t.set_missed_tick_behavior(MissedTickBehavior::Delay);
                t
            });

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Sync loop stopped");
                        break;
                    }
                    change = network.changed() => match change {
                        Some(true) => {
                            info!("Network restored; draining offline queue");
                            runtime.run_cycle("reconnect").await;
                        }
                        Some(false) => {
                            info!("Network offline; keeping offline sales queued");
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if runtime.network.is_online() {
                            runtime.run_cycle("interval").await;
                        }
                    }
                    _ = async {
                        match probe_ticker.as_mut() {
                            Some(t) => { t.tick().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        let reachable = runtime.remote.probe().await;
                        runtime.network.set_online(reachable);
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClearPolicy;
    use crate::remote::fake::FakeTables;

    fn runtime(online: bool) -> Arc<SyncRuntime<FakeTables>> {
        let config = SyncConfig {
            sync_interval_secs: 3600,
            ..SyncConfig::default()
        };
        Arc::new(SyncRuntime::with_store(
            config,
            LocalStore::in_memory(),
            FakeTables::new(),
            online,
        ))
    }

    fn mug() -> GiftSale {
        GiftSale {
            item: "Mug".into(),
            quantity: 2,
            bpx: 1000.0,
            spx: 1500.0,
            sold_by: None,
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_force_sync_refused_while_offline() {
        let rt = runtime(false);
        rt.gifts().record(mug()).unwrap();

        let err = rt.force_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        assert_eq!(rt.queue().len(), 1);
        assert!(rt.last_sync().is_none());
    }

    #[tokio::test]
    async fn test_force_sync_drains_all_categories() {
        let rt = runtime(true);
        rt.gifts().record(mug()).unwrap();
        rt.stationery()
            .record(StationerySale {
                item_id: "ruler".into(),
                quantity: 1,
                selling_price: 100.0,
                total_amount: 100.0,
                sold_by: None,
            })
            .unwrap();

        let reports = rt.force_sync().await.unwrap();

        assert_eq!(reports.iter().map(|r| r.synced).sum::<usize>(), 2);
        assert!(rt.queue().is_empty());
        assert_eq!(rt.pending_counts().total(), 0);
        assert!(rt.last_sync().is_some());
    }

    #[tokio::test]
    async fn test_reconnect_triggers_background_sync() {
        let rt = runtime(false);
        rt.start_sync_loop().unwrap();
        rt.gifts().record(mug()).unwrap();
        rt.gifts().record(mug()).unwrap();

        // Let the loop consume its first interval tick while offline.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rt.queue().len(), 2);

        rt.network().on_online();
        assert!(wait_until(|| rt.queue().is_empty()).await);
        assert_eq!(rt.gifts().pending_count(), 0);

        rt.stop_sync_loop();
        assert!(!rt.is_loop_running());
    }

    #[tokio::test]
    async fn test_second_loop_start_is_rejected() {
        let rt = runtime(true);
        rt.start_sync_loop().unwrap();
        assert!(matches!(rt.start_sync_loop(), Err(SyncError::AlreadyRunning)));
        rt.stop_sync_loop();
        rt.start_sync_loop().unwrap();
        rt.stop_sync_loop();
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let rt = runtime(false);
        rt.gifts().record(mug()).unwrap();

        let status = rt.status();
        assert_eq!(status["isOnline"], false);
        assert_eq!(status["isSyncing"], false);
        assert_eq!(status["pendingTotal"], 1);
        assert_eq!(status["pending"]["gift"], 1);
        assert_eq!(status["queueLength"], 1);
        assert_eq!(status["clearPolicy"], json!(ClearPolicy::Unconditional));
        assert!(status["lastSync"].is_null());
    }

    #[tokio::test]
    async fn test_probe_drives_network_state() {
        let config = SyncConfig {
            sync_interval_secs: 3600,
            probe_interval_secs: Some(1),
            ..SyncConfig::default()
        };
        let rt = Arc::new(SyncRuntime::with_store(
            config,
            LocalStore::in_memory(),
            FakeTables::new(),
            true,
        ));
        rt.remote.set_reachable(false);
        rt.start_sync_loop().unwrap();

        assert!(wait_until(|| !rt.network().is_online()).await);
        rt.gifts().record(mug()).unwrap();
        assert_eq!(rt.queue().len(), 1);

        rt.remote.set_reachable(true);
        assert!(wait_until(|| rt.network().is_online()).await);
        assert!(wait_until(|| rt.queue().is_empty()).await);
        assert!(rt.remote.probe_count() >= 2);

        rt.stop_sync_loop();
    }

    #[tokio::test]
    async fn test_no_probe_without_interval() {
        let rt = runtime(true);
        rt.remote.set_reachable(false);
        rt.start_sync_loop().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rt.network().is_online());
        assert_eq!(rt.remote.probe_count(), 0);

        rt.stop_sync_loop();
    }

    #[test]
    fn test_cache_uses_configured_version() {
        let config = SyncConfig {
            cache_version: "v7".into(),
            ..SyncConfig::default()
        };
        let rt = SyncRuntime::with_store(config, LocalStore::in_memory(), FakeTables::new(), true);
        assert_eq!(rt.cache().current_name(), "point-art-hub-v7");
    }
}
