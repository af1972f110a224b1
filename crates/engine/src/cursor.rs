//! Opaque resume cursors for the merged stream.
//!
//! A cursor encodes "resume strictly after this ordering position" across the
//! merged multi-shop sequence. Callers treat it as an opaque string; the
//! engine round-trips it through base64-encoded JSON so a stale or
//! hand-edited cursor fails loudly instead of silently skipping data.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::TimeZone;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use shopdeck_core::{ItemId, OrderingKey};

use crate::error::MergeError;

/// Current cursor wire version.
const CURSOR_VERSION: u8 = 1;

/// Stream the cursor belongs to. Only orders today, but baked into the wire
/// format so cursors cannot cross streams after a future addition.
const CURSOR_MODE_ORDERS: &str = "orders";

/// Position of the last emitted item in the merged stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorPosition {
    /// Timestamp of the last emitted item, epoch milliseconds.
    #[serde(rename = "ts")]
    timestamp_ms: i64,
    /// Vendor ID of the last emitted item.
    #[serde(rename = "id")]
    item_id: String,
}

/// Resume cursor for [`crate::merge::MergeEngine::merge_page`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCursor {
    #[serde(rename = "v")]
    version: u8,
    #[serde(rename = "m")]
    mode: String,
    #[serde(rename = "p")]
    position: CursorPosition,
}

impl MergeCursor {
    /// Cursor resuming strictly after `key`.
    #[must_use]
    pub fn after(key: &OrderingKey) -> Self {
        Self {
            version: CURSOR_VERSION,
            mode: CURSOR_MODE_ORDERS.to_string(),
            position: CursorPosition {
                timestamp_ms: key.timestamp.timestamp_millis(),
                item_id: key.item_id.as_str().to_string(),
            },
        }
    }

    /// The ordering position this cursor resumes after.
    ///
    /// # Errors
    ///
    /// Returns `MergeError::BadCursor` if the embedded timestamp is outside
    /// the representable range.
    pub fn position(&self) -> Result<OrderingKey, MergeError> {
        let timestamp = Utc
            .timestamp_millis_opt(self.position.timestamp_ms)
            .single()
            .ok_or_else(|| {
                MergeError::BadCursor(format!(
                    "timestamp {} out of range",
                    self.position.timestamp_ms
                ))
            })?;
        Ok(OrderingKey {
            timestamp,
            item_id: ItemId::new(self.position.item_id.clone()),
        })
    }

    /// Encode to the opaque wire form handed to callers.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serialization of this struct cannot fail; fall back to an empty
        // JSON object to keep the signature infallible.
        let json = serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec());
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode an opaque cursor received from a caller.
    ///
    /// # Errors
    ///
    /// Returns `MergeError::BadCursor` for anything that is not a valid
    /// current-version orders cursor.
    pub fn decode(raw: &str) -> Result<Self, MergeError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| MergeError::BadCursor(format!("not base64: {e}")))?;
        let cursor: Self = serde_json::from_slice(&bytes)
            .map_err(|e| MergeError::BadCursor(format!("not a cursor payload: {e}")))?;
        if cursor.version != CURSOR_VERSION {
            return Err(MergeError::BadCursor(format!(
                "unsupported version {}",
                cursor.version
            )));
        }
        if cursor.mode != CURSOR_MODE_ORDERS {
            return Err(MergeError::BadCursor(format!(
                "unsupported mode {:?}",
                cursor.mode
            )));
        }
        Ok(cursor)
    }
}
