//! Sale categories and the records captured for each of them.

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// The three sale categories captured offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleCategory {
    Stationery,
    Gift,
    StationeryDaily,
}

impl SaleCategory {
    pub const ALL: [SaleCategory; 3] = [
        SaleCategory::Stationery,
        SaleCategory::Gift,
        SaleCategory::StationeryDaily,
    ];

    /// Local store key holding this category's offline list.
    pub fn local_key(self) -> &'static str {
        match self {
            SaleCategory::Stationery => "offline_sales",
            SaleCategory::Gift => "offline_gift_sales",
            SaleCategory::StationeryDaily => "offline_stationery_sales",
        }
    }

    pub fn id_prefix(self) -> &'static str {
        match self {
            SaleCategory::Stationery => "offline_",
            SaleCategory::Gift => "offline_gift_",
            SaleCategory::StationeryDaily => "offline_stationery_",
        }
    }

    /// Remote table the category's records are inserted into.
    pub fn endpoint(self) -> &'static str {
        match self {
            SaleCategory::Stationery => "stationery_sales",
            SaleCategory::Gift => "gift_daily_sales",
            SaleCategory::StationeryDaily => "stationery_daily_sales",
        }
    }

    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.endpoint() == endpoint)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SaleCategory::Stationery => "stationery",
            SaleCategory::Gift => "gift",
            SaleCategory::StationeryDaily => "stationery_daily",
        }
    }
}

impl std::fmt::Display for SaleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Category payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationerySale {
    pub item_id: String,
    pub quantity: u32,
    pub selling_price: f64,
    pub total_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sold_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftSale {
    pub item: String,
    pub quantity: u32,
    /// Buying price per unit.
    pub bpx: f64,
    /// Selling price per unit.
    pub spx: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sold_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationeryDailySale {
    pub item: String,
    pub quantity: u32,
    pub rate: f64,
    pub total_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sold_by: Option<String>,
}

/// A sale as captured locally: the category fields plus local identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineSale<K> {
    pub id: String,
    /// Stable idempotency key sent with every replay.
    pub client_ref: Uuid,
    /// Capture time, ISO-8601.
    pub date: String,
    #[serde(flatten)]
    pub sale: K,
}

/// Payload of a sync queue entry, tagged by category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "record", rename_all = "snake_case")]
pub enum SalePayload {
    Stationery(OfflineSale<StationerySale>),
    Gift(OfflineSale<GiftSale>),
    StationeryDaily(OfflineSale<StationeryDailySale>),
}

impl SalePayload {
    pub fn category(&self) -> SaleCategory {
        match self {
            SalePayload::Stationery(_) => SaleCategory::Stationery,
            SalePayload::Gift(_) => SaleCategory::Gift,
            SalePayload::StationeryDaily(_) => SaleCategory::StationeryDaily,
        }
    }

    pub fn sale_id(&self) -> &str {
        match self {
            SalePayload::Stationery(s) => &s.id,
            SalePayload::Gift(s) => &s.id,
            SalePayload::StationeryDaily(s) => &s.id,
        }
    }

    pub fn client_ref(&self) -> Uuid {
        match self {
            SalePayload::Stationery(s) => s.client_ref,
            SalePayload::Gift(s) => s.client_ref,
            SalePayload::StationeryDaily(s) => s.client_ref,
        }
    }

    /// Row body for the remote insert. The local `id` stays local; the
    /// remote table assigns its own key and deduplicates on `client_ref`.
    pub fn to_row(&self) -> Value {
        let mut row = match self {
            SalePayload::Stationery(s) => serde_json::to_value(s),
            SalePayload::Gift(s) => serde_json::to_value(s),
            SalePayload::StationeryDaily(s) => serde_json::to_value(s),
        }
        .unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = row {
            map.remove("id");
        }
        row
    }
}

/// Ties a payload struct to its category and queue variant.
pub trait SaleKind: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const CATEGORY: SaleCategory;

    fn into_payload(sale: OfflineSale<Self>) -> SalePayload;
}

impl SaleKind for StationerySale {
    const CATEGORY: SaleCategory = SaleCategory::Stationery;

    fn into_payload(sale: OfflineSale<Self>) -> SalePayload {
        SalePayload::Stationery(sale)
    }
}

impl SaleKind for GiftSale {
    const CATEGORY: SaleCategory = SaleCategory::Gift;

    fn into_payload(sale: OfflineSale<Self>) -> SalePayload {
        SalePayload::Gift(sale)
    }
}

impl SaleKind for StationeryDailySale {
    const CATEGORY: SaleCategory = SaleCategory::StationeryDaily;

    fn into_payload(sale: OfflineSale<Self>) -> SalePayload {
        SalePayload::StationeryDaily(sale)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Issues `prefix + epoch millis` ids. Two calls in the same millisecond get
/// consecutive values, so an id is never handed out twice per process.
#[derive(Debug, Default)]
pub struct SaleIdGenerator {
    last_millis: AtomicI64,
}

impl SaleIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, category: SaleCategory) -> String {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last_millis.load(Ordering::Relaxed);
        loop {
            let candidate = if now > prev { now } else { prev + 1 };
            match self.last_millis.compare_exchange_weak(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("{}{}", category.id_prefix(), candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Current time as an ISO-8601 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_every_prefix_starts_with_offline() {
        for category in SaleCategory::ALL {
            assert!(category.id_prefix().starts_with("offline_"));
            assert_eq!(SaleCategory::from_endpoint(category.endpoint()), Some(category));
        }
        assert_eq!(SaleCategory::from_endpoint("orders"), None);
    }

    #[test]
    fn test_ids_are_unique_within_one_millisecond() {
        let ids = SaleIdGenerator::new();
        let issued: HashSet<String> = (0..500)
            .map(|_| ids.next_id(SaleCategory::Gift))
            .collect();
        assert_eq!(issued.len(), 500);
    }

    #[test]
    fn test_payload_serializes_with_category_tag() {
        let payload = SalePayload::Gift(OfflineSale {
            id: "offline_gift_1".into(),
            client_ref: Uuid::nil(),
            date: "2026-01-02T03:04:05.000Z".into(),
            sale: GiftSale {
                item: "Mug".into(),
                quantity: 2,
                bpx: 1000.0,
                spx: 1500.0,
                sold_by: None,
            },
        });

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["category"], "gift");
        assert_eq!(value["record"]["item"], "Mug");
        assert_eq!(value["record"]["id"], "offline_gift_1");

        let back: SalePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_row_drops_local_id_and_keeps_client_ref() {
        let payload = SalePayload::Stationery(OfflineSale {
            id: "offline_42".into(),
            client_ref: Uuid::nil(),
            date: "2026-01-02T03:04:05.000Z".into(),
            sale: StationerySale {
                item_id: "pen-blue".into(),
                quantity: 3,
                selling_price: 50.0,
                total_amount: 150.0,
                sold_by: Some("user-7".into()),
            },
        });

        let row = payload.to_row();
        assert!(row.get("id").is_none());
        assert_eq!(row["client_ref"], json!(Uuid::nil()));
        assert_eq!(row["sold_by"], "user-7");
        assert_eq!(row["total_amount"], 150.0);
    }

    #[test]
    fn test_now_iso_parses_as_rfc3339() {
        let ts = now_iso();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
