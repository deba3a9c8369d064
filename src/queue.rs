//! Shared sync queue of outstanding remote writes.
//!
//! The queue is a single list persisted under [`QUEUE_KEY`], oldest entry
//! first. Sequence ids come from a persisted counter and only ever grow.
//! All three sale categories share the list; each one only touches entries
//! tagged with its own endpoint.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::sale::{now_iso, SaleCategory, SalePayload};
use crate::store::LocalStore;

pub const QUEUE_KEY: &str = "offline_sync_queue";
pub const QUEUE_SEQ_KEY: &str = "offline_sync_queue_seq";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    /// Remote table this entry is replayed against.
    pub endpoint: String,
    pub payload: SalePayload,
    pub enqueued_at: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn category(&self) -> SaleCategory {
        self.payload.category()
    }
}

#[derive(Clone)]
pub struct SyncQueue {
    store: LocalStore,
}

impl SyncQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Append `payload`, tagged with its category's endpoint. The entry is
    /// persisted before this returns.
    pub fn enqueue(&self, payload: SalePayload) -> StoreResult<QueueEntry> {
        let floor = self
            .list_pending()
            .iter()
            .map(|e| e.id)
            .max()
            .unwrap_or(0);
        let id = self.store.update(QUEUE_SEQ_KEY, |seq: &mut u64| {
            *seq = (*seq).max(floor) + 1;
            Ok(*seq)
        })?;

        let entry = QueueEntry {
            id,
            endpoint: payload.category().endpoint().to_string(),
            payload,
            enqueued_at: now_iso(),
            attempts: 0,
            last_error: None,
        };

        let stored = entry.clone();
        let depth = self
            .store
            .update(QUEUE_KEY, move |entries: &mut Vec<QueueEntry>| {
                entries.push(stored);
                Ok(entries.len())
            })?;

        debug!(
            queue_id = entry.id,
            endpoint = %entry.endpoint,
            sale_id = entry.payload.sale_id(),
            depth,
            "sync queue entry added"
        );
        Ok(entry)
    }

    /// Every pending entry, oldest first.
    pub fn list_pending(&self) -> Vec<QueueEntry> {
        self.store.get(QUEUE_KEY)
    }

    /// Pending entries tagged with `category`'s endpoint, oldest first.
    pub fn list_for(&self, category: SaleCategory) -> Vec<QueueEntry> {
        self.list_pending()
            .into_iter()
            .filter(|e| e.endpoint == category.endpoint())
            .collect()
    }

    /// Drop the entry with `id`. Returns whether an entry was removed;
    /// removing an absent id leaves the queue untouched.
    pub fn remove_by_id(&self, id: u64) -> StoreResult<bool> {
        let removed = self
            .store
            .update(QUEUE_KEY, |entries: &mut Vec<QueueEntry>| {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                Ok(entries.len() != before)
            })?;
        if removed {
            info!(queue_id = id, "sync queue entry removed");
        }
        Ok(removed)
    }

    /// Note a failed replay on the entry. It stays queued.
    pub fn record_failure(&self, id: u64, error: &str) -> StoreResult<()> {
        self.store
            .update(QUEUE_KEY, |entries: &mut Vec<QueueEntry>| {
                if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                    entry.attempts = entry.attempts.saturating_add(1);
                    entry.last_error = Some(error.to_string());
                }
                Ok(())
            })
    }

    pub fn contains_sale(&self, sale_id: &str) -> bool {
        self.list_pending()
            .iter()
            .any(|e| e.payload.sale_id() == sale_id)
    }

    pub fn len(&self) -> usize {
        self.list_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list_pending().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sale::{GiftSale, OfflineSale, StationerySale};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use uuid::Uuid;

    fn gift(id: &str) -> SalePayload {
        SalePayload::Gift(OfflineSale {
            id: id.into(),
            client_ref: Uuid::new_v4(),
            date: now_iso(),
            sale: GiftSale {
                item: "Mug".into(),
                quantity: 1,
                bpx: 10.0,
                spx: 15.0,
                sold_by: None,
            },
        })
    }

    fn stationery(id: &str) -> SalePayload {
        SalePayload::Stationery(OfflineSale {
            id: id.into(),
            client_ref: Uuid::new_v4(),
            date: now_iso(),
            sale: StationerySale {
                item_id: "pencil".into(),
                quantity: 4,
                selling_price: 5.0,
                total_amount: 20.0,
                sold_by: None,
            },
        })
    }

    #[test]
    fn test_enqueue_assigns_increasing_ids_in_fifo_order() {
        let queue = SyncQueue::new(LocalStore::in_memory());
        let a = queue.enqueue(gift("offline_gift_1")).unwrap();
        let b = queue.enqueue(stationery("offline_2")).unwrap();
        let c = queue.enqueue(gift("offline_gift_3")).unwrap();

        assert!(a.id < b.id && b.id < c.id);
        let ids: Vec<u64> = queue.list_pending().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(a.endpoint, "gift_daily_sales");
        assert_eq!(b.endpoint, "stationery_sales");
    }

    #[test]
    fn test_list_for_filters_by_endpoint() {
        let queue = SyncQueue::new(LocalStore::in_memory());
        queue.enqueue(gift("offline_gift_1")).unwrap();
        queue.enqueue(stationery("offline_2")).unwrap();
        queue.enqueue(gift("offline_gift_3")).unwrap();

        let gifts = queue.list_for(SaleCategory::Gift);
        assert_eq!(gifts.len(), 2);
        assert!(gifts.iter().all(|e| e.category() == SaleCategory::Gift));
        assert!(queue.list_for(SaleCategory::StationeryDaily).is_empty());
    }

    #[test]
    fn test_remove_by_id_is_idempotent() {
        let queue = SyncQueue::new(LocalStore::in_memory());
        let a = queue.enqueue(gift("offline_gift_1")).unwrap();
        let b = queue.enqueue(gift("offline_gift_2")).unwrap();

        assert!(queue.remove_by_id(a.id).unwrap());
        let once = queue.list_pending();
        assert!(!queue.remove_by_id(a.id).unwrap());
        let twice = queue.list_pending();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
        assert_eq!(twice[0].id, b.id);
    }

    #[test]
    fn test_ids_never_reused_after_removal() {
        let queue = SyncQueue::new(LocalStore::in_memory());
        let a = queue.enqueue(gift("offline_gift_1")).unwrap();
        queue.remove_by_id(a.id).unwrap();
        let b = queue.enqueue(gift("offline_gift_2")).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_lost_counter_does_not_collide_with_queued_ids() {
        let store = LocalStore::in_memory();
        let queue = SyncQueue::new(store.clone());
        queue.enqueue(gift("offline_gift_1")).unwrap();
        let b = queue.enqueue(gift("offline_gift_2")).unwrap();

        store.remove(QUEUE_SEQ_KEY).unwrap();
        let c = queue.enqueue(gift("offline_gift_3")).unwrap();
        assert!(c.id > b.id);
    }

    #[test]
    fn test_record_failure_keeps_entry_and_counts_attempts() {
        let queue = SyncQueue::new(LocalStore::in_memory());
        let a = queue.enqueue(gift("offline_gift_1")).unwrap();

        queue.record_failure(a.id, "HTTP 500").unwrap();
        queue.record_failure(a.id, "HTTP 503").unwrap();

        let pending = queue.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(pending[0].payload, a.payload);
    }

    #[test]
    fn test_read_failure_keeps_queued_entries() {
        let backend = Arc::new(MemoryStore::new());
        let queue = SyncQueue::new(LocalStore::new(backend.clone()));
        let first = queue.enqueue(gift("offline_gift_1")).unwrap();
        queue.enqueue(stationery("offline_2")).unwrap();

        backend.fail_reads_for(QUEUE_KEY);
        assert!(queue.enqueue(gift("offline_gift_3")).is_err());
        assert!(queue.remove_by_id(first.id).is_err());
        assert!(queue.record_failure(first.id, "HTTP 503").is_err());
        backend.restore_reads_for(QUEUE_KEY);

        let sale_ids: Vec<String> = queue
            .list_pending()
            .iter()
            .map(|e| e.payload.sale_id().to_string())
            .collect();
        assert_eq!(sale_ids, vec!["offline_gift_1", "offline_2"]);
        assert_eq!(queue.list_pending()[0].attempts, 0);
    }

    #[test]
    fn test_corrupt_queue_reads_empty() {
        let store = LocalStore::in_memory();
        store.store(QUEUE_KEY, &serde_json::json!({"oops": true})).unwrap();
        let queue = SyncQueue::new(store);
        assert!(queue.is_empty());
        assert!(!queue.contains_sale("offline_1"));
    }
}
