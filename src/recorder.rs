//! Local-first sale capture, one recorder per sale category.
//!
//! `record` writes the sale to the category's offline list and mirrors it
//! into the shared sync queue. If the queue write fails the list write is
//! undone, so a recorded sale always has a queue entry at creation time.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::queue::SyncQueue;
use crate::sale::{now_iso, OfflineSale, SaleCategory, SaleIdGenerator, SaleKind};
use crate::store::LocalStore;

pub struct OfflineSaleRecorder<K: SaleKind> {
    store: LocalStore,
    queue: SyncQueue,
    ids: Arc<SaleIdGenerator>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SaleKind> OfflineSaleRecorder<K> {
    pub fn new(store: LocalStore, queue: SyncQueue, ids: Arc<SaleIdGenerator>) -> Self {
        Self {
            store,
            queue,
            ids,
            _kind: PhantomData,
        }
    }

    pub fn category(&self) -> SaleCategory {
        K::CATEGORY
    }

    /// Stamp `draft` with an id, idempotency key and capture time, persist it
    /// to the offline list and enqueue it for replay.
    pub fn record(&self, draft: K) -> StoreResult<OfflineSale<K>> {
        let category = K::CATEGORY;
        let sale = OfflineSale {
            id: self.ids.next_id(category),
            client_ref: Uuid::new_v4(),
            date: now_iso(),
            sale: draft,
        };

        let appended = sale.clone();
        self.store
            .update(category.local_key(), move |list: &mut Vec<OfflineSale<K>>| {
                list.push(appended);
                Ok(())
            })?;

        if let Err(e) = self.queue.enqueue(K::into_payload(sale.clone())) {
            let sale_id = sale.id.clone();
            let rollback = self
                .store
                .update(category.local_key(), |list: &mut Vec<OfflineSale<K>>| {
                    list.retain(|s| s.id != sale_id);
                    Ok(())
                });
            match rollback {
                Ok(()) => error!(
                    category = %category,
                    sale_id = %sale.id,
                    error = %e,
                    "sync queue write failed, offline record rolled back"
                ),
                Err(rollback_err) => error!(
                    category = %category,
                    sale_id = %sale.id,
                    error = %e,
                    rollback_error = %rollback_err,
                    "sync queue write failed and rollback failed; record is not queued"
                ),
            }
            return Err(e);
        }

        info!(category = %category, sale_id = %sale.id, "sale recorded offline");
        Ok(sale)
    }

    /// Offline records for this category, oldest first.
    pub fn pending(&self) -> Vec<OfflineSale<K>> {
        self.store.get(K::CATEGORY.local_key())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Drop the whole offline list. Queue entries are left alone.
    pub fn clear(&self) -> StoreResult<usize> {
        let count = self.pending_count();
        self.store.remove(K::CATEGORY.local_key())?;
        Ok(count)
    }

    /// Local records that have no sync queue entry.
    pub fn find_unqueued(&self) -> Vec<OfflineSale<K>> {
        let queued: HashSet<String> = self
            .queue
            .list_for(K::CATEGORY)
            .into_iter()
            .map(|e| e.payload.sale_id().to_string())
            .collect();
        self.pending()
            .into_iter()
            .filter(|s| !queued.contains(&s.id))
            .collect()
    }
}

/// Category-erased view of an offline list, used by the reconciler.
pub trait OfflineLedger: Send + Sync {
    fn category(&self) -> SaleCategory;
    fn pending_count(&self) -> usize;
    fn pending_ids(&self) -> Vec<String>;
    /// Remove every record; returns how many were dropped.
    fn clear_all(&self) -> StoreResult<usize>;
    /// Keep only records whose id is in `keep`; returns how many were dropped.
    fn retain_ids(&self, keep: &HashSet<String>) -> StoreResult<usize>;
}

impl<K: SaleKind> OfflineLedger for OfflineSaleRecorder<K> {
    fn category(&self) -> SaleCategory {
        K::CATEGORY
    }

    fn pending_count(&self) -> usize {
        OfflineSaleRecorder::pending_count(self)
    }

    fn pending_ids(&self) -> Vec<String> {
        self.pending().into_iter().map(|s| s.id).collect()
    }

    fn clear_all(&self) -> StoreResult<usize> {
        self.clear()
    }

    fn retain_ids(&self, keep: &HashSet<String>) -> StoreResult<usize> {
        self.store
            .update(K::CATEGORY.local_key(), |list: &mut Vec<OfflineSale<K>>| {
                let before = list.len();
                list.retain(|s| keep.contains(&s.id));
                Ok(before - list.len())
            })
    }
}

/// Per-category pending counts for status displays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCounts {
    pub stationery: usize,
    pub gift: usize,
    pub stationery_daily: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.stationery + self.gift + self.stationery_daily
    }
}
