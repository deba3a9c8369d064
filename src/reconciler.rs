//! Drains the sync queue against the remote tables.
//!
//! A pass for one category replays its queue entries oldest first, one at a
//! time. A successful insert removes the entry; a failed one stays queued and
//! the pass moves on. When the pass ends the category's offline list is
//! cleared per [`ClearPolicy`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::ClearPolicy;
use crate::error::{RemoteError, SyncError};
use crate::queue::{QueueEntry, SyncQueue};
use crate::recorder::OfflineLedger;
use crate::remote::RemoteTables;
use crate::sale::{SaleCategory, SalePayload};

/// Outcome of one category pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub category: Option<SaleCategory>,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Offline records dropped from the local list at the end of the pass.
    pub cleared: usize,
}

impl SyncReport {
    fn idle(category: SaleCategory) -> Self {
        Self {
            category: Some(category),
            ..Self::default()
        }
    }
}

/// Keeps the syncing flag raised while at least one pass is running.
struct SyncingGuard<'a> {
    in_flight: &'a AtomicUsize,
    flag: &'a watch::Sender<bool>,
}

impl<'a> SyncingGuard<'a> {
    fn enter(in_flight: &'a AtomicUsize, flag: &'a watch::Sender<bool>) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        flag.send_replace(true);
        Self { in_flight, flag }
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.flag.send_replace(false);
        }
    }
}

pub struct SyncReconciler<R: RemoteTables> {
    queue: SyncQueue,
    remote: Arc<R>,
    ledgers: Vec<Arc<dyn OfflineLedger>>,
    policy: ClearPolicy,
    syncing: watch::Sender<bool>,
    in_flight: AtomicUsize,
    // Serializes passes so two callers never replay the same entry at once.
    pass_lock: AsyncMutex<()>,
}

impl<R: RemoteTables> SyncReconciler<R> {
    pub fn new(
        queue: SyncQueue,
        remote: Arc<R>,
        ledgers: Vec<Arc<dyn OfflineLedger>>,
        policy: ClearPolicy,
    ) -> Self {
        let (syncing, _rx) = watch::channel(false);
        Self {
            queue,
            remote,
            ledgers,
            policy,
            syncing,
            in_flight: AtomicUsize::new(0),
            pass_lock: AsyncMutex::new(()),
        }
    }

    pub fn policy(&self) -> ClearPolicy {
        self.policy
    }

    pub fn is_syncing(&self) -> bool {
        *self.syncing.borrow()
    }

    pub fn subscribe_syncing(&self) -> watch::Receiver<bool> {
        self.syncing.subscribe()
    }

    fn ledger(&self, category: SaleCategory) -> Option<&Arc<dyn OfflineLedger>> {
        self.ledgers.iter().find(|l| l.category() == category)
    }

    /// Replay every queued entry for `category`.
    ///
    /// Returns immediately, without touching the remote service, when the
    /// category has no offline records. Local store failures while clearing
    /// the list are returned; remote failures never are.
    pub async fn sync_pending(&self, category: SaleCategory) -> Result<SyncReport, SyncError> {
        let Some(ledger) = self.ledger(category) else {
            warn!(category = %category, "no offline list registered for category");
            return Ok(SyncReport::idle(category));
        };
        if ledger.pending_count() == 0 {
            debug!(category = %category, "nothing pending, skipping sync");
            return Ok(SyncReport::idle(category));
        }

        let _pass = self.pass_lock.lock().await;
        let _syncing = SyncingGuard::enter(&self.in_flight, &self.syncing);

        let mut report = SyncReport::idle(category);
        let entries = self.queue.list_for(category);
        info!(category = %category, entries = entries.len(), "syncing offline sales");

        for entry in entries {
            report.attempted += 1;
            match self.replay(&entry).await {
                Ok(()) => match self.queue.remove_by_id(entry.id) {
                    Ok(_) => report.synced += 1,
                    Err(e) => {
                        // The insert landed; the entry will be replayed again
                        // and deduplicated remotely by client_ref.
                        warn!(queue_id = entry.id, error = %e, "synced entry could not be dequeued");
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    warn!(
                        category = %category,
                        queue_id = entry.id,
                        sale_id = entry.payload.sale_id(),
                        error = %e,
                        "offline sale replay failed, keeping it queued"
                    );
                    report.failed += 1;
                    if let Err(store_err) = self.queue.record_failure(entry.id, &e.to_string()) {
                        warn!(queue_id = entry.id, error = %store_err, "could not record replay failure");
                    }
                }
            }
        }

        report.cleared = match self.policy {
            ClearPolicy::Unconditional => ledger.clear_all()?,
            ClearPolicy::SyncedOnly => {
                let still_queued: HashSet<String> = self
                    .queue
                    .list_for(category)
                    .into_iter()
                    .map(|e| e.payload.sale_id().to_string())
                    .collect();
                ledger.retain_ids(&still_queued)?
            }
        };

        info!(
            category = %category,
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            cleared = report.cleared,
            "sync pass complete"
        );
        Ok(report)
    }

    /// Run a pass for every category in turn.
    pub async fn sync_all(&self) -> Result<Vec<SyncReport>, SyncError> {
        let mut reports = Vec::with_capacity(SaleCategory::ALL.len());
        for category in SaleCategory::ALL {
            reports.push(self.sync_pending(category).await?);
        }
        Ok(reports)
    }

    async fn replay(&self, entry: &QueueEntry) -> Result<(), RemoteError> {
        let category = entry.category();
        if entry.endpoint != category.endpoint() {
            warn!(
                queue_id = entry.id,
                endpoint = %entry.endpoint,
                expected = category.endpoint(),
                "queue entry endpoint does not match its payload, using payload category"
            );
        }
        let table = match &entry.payload {
            SalePayload::Stationery(_) => SaleCategory::Stationery.endpoint(),
            SalePayload::Gift(_) => SaleCategory::Gift.endpoint(),
            SalePayload::StationeryDaily(_) => SaleCategory::StationeryDaily.endpoint(),
        };
        self.remote
            .insert(table, entry.payload.to_row(), entry.payload.client_ref())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::OfflineSaleRecorder;
    use crate::remote::fake::FakeTables;
    use crate::sale::{GiftSale, SaleIdGenerator, StationerySale};
    use crate::store::LocalStore;

    struct Harness {
        queue: SyncQueue,
        gifts: Arc<OfflineSaleRecorder<GiftSale>>,
        stationery: Arc<OfflineSaleRecorder<StationerySale>>,
        remote: Arc<FakeTables>,
        reconciler: SyncReconciler<FakeTables>,
    }

    fn harness(policy: ClearPolicy) -> Harness {
        let store = LocalStore::in_memory();
        let queue = SyncQueue::new(store.clone());
        let ids = Arc::new(SaleIdGenerator::new());
        let gifts = Arc::new(OfflineSaleRecorder::new(store.clone(), queue.clone(), ids.clone()));
        let stationery = Arc::new(OfflineSaleRecorder::new(store, queue.clone(), ids));
        let remote = Arc::new(FakeTables::new());
        let reconciler = SyncReconciler::new(
            queue.clone(),
            remote.clone(),
            vec![
                gifts.clone() as Arc<dyn OfflineLedger>,
                stationery.clone() as Arc<dyn OfflineLedger>,
            ],
            policy,
        );
        Harness {
            queue,
            gifts,
            stationery,
            remote,
            reconciler,
        }
    }

    fn gift(item: &str) -> GiftSale {
        GiftSale {
            item: item.into(),
            quantity: 2,
            bpx: 1000.0,
            spx: 1500.0,
            sold_by: None,
        }
    }

    fn pens() -> StationerySale {
        StationerySale {
            item_id: "pen".into(),
            quantity: 3,
            selling_price: 20.0,
            total_amount: 60.0,
            sold_by: None,
        }
    }

    #[tokio::test]
    async fn test_empty_list_is_a_noop() {
        let h = harness(ClearPolicy::Unconditional);
        let mut flag = h.reconciler.subscribe_syncing();

        let report = h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

        assert_eq!(report, SyncReport::idle(SaleCategory::Gift));
        assert_eq!(h.remote.call_count(), 0);
        assert!(!h.reconciler.is_syncing());
        assert!(!flag.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_gift_sale_scenario_syncs_and_clears() {
        let h = harness(ClearPolicy::Unconditional);
        let sale = h.gifts.record(gift("Mug")).unwrap();

        assert_eq!(h.gifts.pending_count(), 1);
        let queued = h.queue.list_pending();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].endpoint, SaleCategory::Gift.endpoint());

        let report = h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(report.cleared, 1);
        assert!(h.queue.is_empty());
        assert_eq!(h.gifts.pending_count(), 0);

        let calls = h.remote.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "gift_daily_sales");
        assert_eq!(calls[0].1["item"], "Mug");
        assert_eq!(calls[0].2, sale.client_ref);
    }

    #[tokio::test]
    async fn test_failed_entry_stays_queued_regardless_of_position() {
        for n in 1..=4usize {
            for k in 0..n {
                let h = harness(ClearPolicy::Unconditional);
                let sales: Vec<_> = (0..n)
                    .map(|i| h.gifts.record(gift(&format!("item-{i}"))).unwrap())
                    .collect();
                h.remote.fail_for(sales[k].client_ref);

                let report = h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

                let remaining = h.queue.list_pending();
                assert_eq!(remaining.len(), 1, "n={n} k={k}");
                assert_eq!(remaining[0].payload.sale_id(), sales[k].id);
                assert_eq!(remaining[0].attempts, 1);
                assert_eq!(report.attempted, n);
                assert_eq!(report.synced, n - 1);
                assert_eq!(report.failed, 1);
                assert_eq!(h.remote.call_count(), n);
            }
        }
    }

    #[tokio::test]
    async fn test_unconditional_policy_clears_list_even_after_failures() {
        let h = harness(ClearPolicy::Unconditional);
        let failing = h.gifts.record(gift("Frame")).unwrap();
        h.gifts.record(gift("Mug")).unwrap();
        h.remote.fail_for(failing.client_ref);

        let report = h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

        assert_eq!(report.cleared, 2);
        assert_eq!(h.gifts.pending_count(), 0);
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.gifts.find_unqueued().len(), 0);
    }

    #[tokio::test]
    async fn test_synced_only_policy_keeps_unsynced_records() {
        let h = harness(ClearPolicy::SyncedOnly);
        let failing = h.gifts.record(gift("Frame")).unwrap();
        h.gifts.record(gift("Mug")).unwrap();
        h.remote.fail_for(failing.client_ref);

        let report = h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

        assert_eq!(report.cleared, 1);
        assert_eq!(h.gifts.pending(), vec![failing]);
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pass_only_touches_its_own_category() {
        let h = harness(ClearPolicy::Unconditional);
        h.gifts.record(gift("Mug")).unwrap();
        h.stationery.record(pens()).unwrap();

        h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

        assert_eq!(h.remote.tables_called(), vec!["gift_daily_sales".to_string()]);
        assert_eq!(h.stationery.pending_count(), 1);
        assert_eq!(h.queue.list_for(SaleCategory::Stationery).len(), 1);
    }

    #[tokio::test]
    async fn test_sync_all_replays_every_category_fifo() {
        let h = harness(ClearPolicy::Unconditional);
        let first = h.gifts.record(gift("Mug")).unwrap();
        h.stationery.record(pens()).unwrap();
        let second = h.gifts.record(gift("Card")).unwrap();

        let reports = h.reconciler.sync_all().await.unwrap();

        assert_eq!(reports.len(), SaleCategory::ALL.len());
        assert!(h.queue.is_empty());
        let calls = h.remote.calls.lock().unwrap();
        let gift_refs: Vec<_> = calls
            .iter()
            .filter(|(t, _, _)| t == "gift_daily_sales")
            .map(|(_, _, r)| *r)
            .collect();
        assert_eq!(gift_refs, vec![first.client_ref, second.client_ref]);
    }

    #[tokio::test]
    async fn test_syncing_flag_resets_after_total_failure() {
        let h = harness(ClearPolicy::Unconditional);
        h.gifts.record(gift("Mug")).unwrap();
        h.remote.fail_everything(true);
        let mut flag = h.reconciler.subscribe_syncing();

        let report = h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(flag.has_changed().unwrap());
        assert!(!*flag.borrow_and_update());
        assert!(!h.reconciler.is_syncing());
    }

    #[tokio::test]
    async fn test_replay_sends_same_client_ref_on_retry() {
        let h = harness(ClearPolicy::SyncedOnly);
        let sale = h.gifts.record(gift("Mug")).unwrap();
        h.remote.fail_everything(true);
        h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

        h.remote.fail_everything(false);
        h.reconciler.sync_pending(SaleCategory::Gift).await.unwrap();

        let calls = h.remote.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, _, r)| *r == sale.client_ref));
        assert!(h.queue.is_empty());
    }
}
