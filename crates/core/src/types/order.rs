//! Normalized order records and their merge ordering key.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::id::{ItemId, ShopId};

/// One order as seen through the aggregation engine.
///
/// Upstream envelopes vary wildly; the source adapter extracts the handful of
/// fields the engine orders, filters, and counts by, and keeps the original
/// payload in `raw` for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Vendor-assigned order identifier, unique per shop.
    pub item_id: ItemId,
    /// Shop the order belongs to.
    pub shop_id: ShopId,
    /// Vendor order status (e.g., `PENDING`, `SHIPPED`), if present.
    pub status: Option<String>,
    /// Quality-control status, if the vendor reports one.
    pub qc_status: Option<String>,
    /// Order total, if the vendor reports one.
    pub total: Option<Decimal>,
    /// Last update timestamp; the primary merge ordering field.
    pub updated_at: DateTime<Utc>,
    /// Original upstream payload, passed through untouched.
    pub raw: serde_json::Value,
}

impl OrderRecord {
    /// The `(timestamp, item_id)` key the cross-shop merge orders by.
    #[must_use]
    pub fn ordering_key(&self) -> OrderingKey {
        OrderingKey {
            timestamp: self.updated_at,
            item_id: self.item_id.clone(),
        }
    }
}

/// Position of an item in the globally merged stream.
///
/// `Ord` is ascending `(timestamp, item_id)`; the merged stream is emitted in
/// *descending* key order (newest first), so the merge engine selects the
/// maximum key and "strictly after cursor" means a key strictly less than the
/// cursor position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderingKey {
    /// Item timestamp (vendor update time).
    pub timestamp: DateTime<Utc>,
    /// Vendor item ID, breaking timestamp ties lexicographically.
    pub item_id: ItemId,
}
