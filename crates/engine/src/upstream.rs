//! Upstream vendor collection client and envelope normalization.
//!
//! The vendor's collection endpoints all follow one shape - `GET
//! <collection>?size=N&token=<opaque>&<filters>` returning a JSON body with
//! an item array and a continuation token - but the envelope key names vary
//! between deployments (`orders`/`items`/`data`, `nextToken`/`token`/`next`).
//! All of that variability is isolated in [`normalize_envelope`] so callers
//! only ever see a flat item list plus an optional next-page token.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use tracing::{instrument, warn};
use url::Url;

use shopdeck_core::{ItemId, OrderRecord, ShopCredential, ShopId};

use crate::config::EngineConfig;
use crate::error::UpstreamError;
use crate::retry::{RetryPolicy, Retryable, is_retryable_status};

/// Cap on error-body bytes kept for diagnostics.
const ERROR_BODY_LIMIT: usize = 512;

/// Keys an item array may hide under.
const ITEM_KEYS: [&str; 3] = ["orders", "items", "data"];
/// Keys a continuation token may hide under.
const TOKEN_KEYS: [&str; 3] = ["nextToken", "token", "next"];

/// Epoch values at or above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Filter parameters forwarded to the vendor's collection endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageParams {
    /// Restrict to one vendor order status.
    pub status: Option<String>,
    /// Lower bound on update time.
    pub date_from: Option<DateTime<Utc>>,
    /// Upper bound on update time.
    pub date_to: Option<DateTime<Utc>>,
    /// Free-text search.
    pub search: Option<String>,
}

impl PageParams {
    /// Params filtering on a single status.
    #[must_use]
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }

    fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(status) = &self.status {
            query.push(("status", status.clone()));
        }
        if let Some(from) = &self.date_from {
            query.push(("from", from.to_rfc3339()));
        }
        if let Some(to) = &self.date_to {
            query.push(("to", to.to_rfc3339()));
        }
        if let Some(search) = &self.search {
            query.push(("q", search.clone()));
        }
        query
    }
}

/// One normalized page from a shop's collection endpoint.
#[derive(Debug, Clone, Default)]
pub struct UpstreamPage {
    /// Normalized items, in the order the vendor returned them.
    pub items: Vec<OrderRecord>,
    /// Continuation token; `None` means the source is exhausted.
    pub next_token: Option<String>,
}

/// Fetch one page from one shop's collection endpoint.
///
/// Abstracted so tests can script upstream behavior; production uses
/// [`HttpUpstreamClient`].
pub trait UpstreamClient: Send + Sync {
    /// Fetch a page, already authenticated with `bearer`.
    fn fetch_page<'a>(
        &'a self,
        credential: &'a ShopCredential,
        params: &'a PageParams,
        page_size: u32,
        page_token: Option<&'a str>,
        bearer: &'a str,
    ) -> BoxFuture<'a, Result<UpstreamPage, UpstreamError>>;
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Fetch { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// `UpstreamClient` over HTTP with retry and per-request timeout.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    /// Collection path under each shop's API base, e.g. `orders`.
    collection: String,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl HttpUpstreamClient {
    /// Create a client for one collection.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        collection: impl Into<String>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            collection: collection.into(),
            retry,
            request_timeout,
        }
    }

    /// Create a client tuned from engine configuration: the shared retry
    /// policy plus the configured page-fetch timeout.
    #[must_use]
    pub fn from_config(
        client: reqwest::Client,
        collection: impl Into<String>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(
            client,
            collection,
            RetryPolicy::new(&config.token.retry),
            config.merge.fetch_timeout,
        )
    }

    #[instrument(skip_all, fields(shop_id = %credential.shop_id, page_size))]
    async fn fetch_once(
        &self,
        credential: &ShopCredential,
        params: &PageParams,
        page_size: u32,
        page_token: Option<&str>,
        bearer: &str,
    ) -> Result<UpstreamPage, UpstreamError> {
        let shop_id = credential.shop_id.clone();
        let raw_url = format!(
            "{}/{}",
            credential.api_base.trim_end_matches('/'),
            self.collection
        );
        let url = Url::parse(&raw_url).map_err(|e| UpstreamError::Transport {
            shop_id: shop_id.clone(),
            message: format!("invalid API base `{raw_url}`: {e}"),
        })?;

        let mut query = vec![("size", page_size.to_string())];
        if let Some(token) = page_token {
            query.push(("token", token.to_string()));
        }
        query.extend(params.to_query());

        let request = self
            .client
            .get(url)
            .query(&query)
            .bearer_auth(bearer)
            .send();

        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| UpstreamError::Timeout {
                shop_id: shop_id.clone(),
                timeout: self.request_timeout,
            })?
            .map_err(|e| UpstreamError::Transport {
                shop_id: shop_id.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs);
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(ERROR_BODY_LIMIT);
            return Err(UpstreamError::Fetch {
                shop_id,
                status: status.as_u16(),
                message,
                retry_after,
            });
        }

        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| UpstreamError::Envelope {
                    shop_id: shop_id.clone(),
                    message: format!("body is not JSON: {e}"),
                })?;

        normalize_envelope(&shop_id, &body)
    }
}

impl UpstreamClient for HttpUpstreamClient {
    fn fetch_page<'a>(
        &'a self,
        credential: &'a ShopCredential,
        params: &'a PageParams,
        page_size: u32,
        page_token: Option<&'a str>,
        bearer: &'a str,
    ) -> BoxFuture<'a, Result<UpstreamPage, UpstreamError>> {
        async move {
            self.retry
                .run(|_attempt| self.fetch_once(credential, params, page_size, page_token, bearer))
                .await
        }
        .boxed()
    }
}

/// Normalize a raw response body into a flat item list plus next-page token.
///
/// An empty or missing continuation token means the source is exhausted.
/// Items the engine cannot order (no ID or no timestamp) are skipped with a
/// warning rather than failing the page.
///
/// # Errors
///
/// Returns `UpstreamError::Envelope` if no recognized collection key holds
/// an array.
pub fn normalize_envelope(
    shop_id: &ShopId,
    body: &serde_json::Value,
) -> Result<UpstreamPage, UpstreamError> {
    let raw_items = ITEM_KEYS
        .iter()
        .find_map(|key| body.get(key).and_then(serde_json::Value::as_array))
        .ok_or_else(|| UpstreamError::Envelope {
            shop_id: shop_id.clone(),
            message: format!("no item array under any of {ITEM_KEYS:?}"),
        })?;

    let next_token = TOKEN_KEYS
        .iter()
        .find_map(|key| body.get(key).and_then(serde_json::Value::as_str))
        .filter(|token| !token.is_empty())
        .map(String::from);

    let mut items = Vec::with_capacity(raw_items.len());
    let mut skipped = 0usize;
    for raw in raw_items {
        match parse_order(shop_id, raw) {
            Some(record) => items.push(record),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(shop_id = %shop_id, skipped, "skipped upstream items without id or timestamp");
    }

    Ok(UpstreamPage { items, next_token })
}

/// Extract the fields the engine orders and counts by; keep the raw payload.
fn parse_order(shop_id: &ShopId, raw: &serde_json::Value) -> Option<OrderRecord> {
    let item_id = ["id", "orderId", "order_id"]
        .iter()
        .find_map(|key| raw.get(key))
        .and_then(value_as_id)?;

    let updated_at = [
        "updatedAt",
        "updateTime",
        "updated_at",
        "createdAt",
        "createTime",
        "created_at",
    ]
    .iter()
    .find_map(|key| raw.get(key).and_then(parse_timestamp))?;

    let status = ["status", "orderStatus", "order_status"]
        .iter()
        .find_map(|key| raw.get(key).and_then(serde_json::Value::as_str))
        .map(String::from);

    let qc_status = ["qcStatus", "qc_status"]
        .iter()
        .find_map(|key| raw.get(key).and_then(serde_json::Value::as_str))
        .map(String::from);

    let total = ["totalAmount", "total_amount", "total"]
        .iter()
        .find_map(|key| raw.get(key))
        .and_then(parse_decimal);

    Some(OrderRecord {
        item_id: ItemId::new(item_id),
        shop_id: shop_id.clone(),
        status,
        qc_status,
        total,
        updated_at,
        raw: raw.clone(),
    })
}

/// IDs arrive as strings or bare numbers depending on the deployment.
fn value_as_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Timestamps arrive as RFC 3339 strings or epoch seconds/milliseconds.
///
/// Truncated to millisecond precision: resume cursors encode positions in
/// epoch milliseconds, so any finer precision on a record would make its key
/// compare above the cursor position and be skipped on resume.
fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .and_then(|dt| Utc.timestamp_millis_opt(dt.timestamp_millis()).single()),
        serde_json::Value::Number(n) => {
            let epoch = n.as_i64()?;
            if epoch >= EPOCH_MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            }
        }
        _ => None,
    }
}

fn parse_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shop() -> ShopId {
        ShopId::new("s1")
    }

    #[test]
    fn test_normalize_recognizes_each_item_key() {
        for key in ITEM_KEYS {
            let body = json!({ key: [{ "id": "o-1", "updatedAt": 1_700_000_000 }] });
            let page = normalize_envelope(&shop(), &body).unwrap();
            assert_eq!(page.items.len(), 1, "key {key}");
            assert!(page.next_token.is_none());
        }
    }

    #[test]
    fn test_normalize_recognizes_each_token_key() {
        for key in TOKEN_KEYS {
            let body = json!({ "items": [], key: "abc" });
            let page = normalize_envelope(&shop(), &body).unwrap();
            assert_eq!(page.next_token.as_deref(), Some("abc"), "key {key}");
        }
    }

    #[test]
    fn test_empty_token_means_exhausted() {
        let body = json!({ "items": [], "nextToken": "" });
        let page = normalize_envelope(&shop(), &body).unwrap();
        assert!(page.next_token.is_none());
    }

    #[test]
    fn test_unrecognized_envelope_is_an_error() {
        let body = json!({ "results": [] });
        let err = normalize_envelope(&shop(), &body).unwrap_err();
        assert!(matches!(err, UpstreamError::Envelope { .. }));
    }

    #[test]
    fn test_malformed_items_are_skipped_not_fatal() {
        let body = json!({
            "orders": [
                { "id": "o-1", "updatedAt": 1_700_000_000 },
                { "note": "no id or timestamp" },
                { "id": "o-2" },
            ],
            "next": "t2"
        });
        let page = normalize_envelope(&shop(), &body).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].item_id, ItemId::new("o-1"));
        assert_eq!(page.next_token.as_deref(), Some("t2"));
    }

    #[test]
    fn test_parse_order_fields() {
        let raw = json!({
            "orderId": 4711,
            "updateTime": 1_700_000_000_500_i64,
            "orderStatus": "SHIPPED",
            "qcStatus": "PASSED",
            "totalAmount": "19.99",
        });
        let record = parse_order(&shop(), &raw).unwrap();
        assert_eq!(record.item_id, ItemId::new("4711"));
        assert_eq!(record.status.as_deref(), Some("SHIPPED"));
        assert_eq!(record.qc_status.as_deref(), Some("PASSED"));
        assert_eq!(record.total, Some(Decimal::new(1999, 2)));
        assert_eq!(record.updated_at.timestamp_millis(), 1_700_000_000_500);
        assert_eq!(record.raw, raw);
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let rfc = parse_timestamp(&json!("2024-03-01T12:00:00Z")).unwrap();
        assert_eq!(rfc.timestamp(), 1_709_294_400);

        let secs = parse_timestamp(&json!(1_700_000_000)).unwrap();
        assert_eq!(secs.timestamp(), 1_700_000_000);

        let millis = parse_timestamp(&json!(1_700_000_000_000_i64)).unwrap();
        assert_eq!(millis.timestamp(), 1_700_000_000);

        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&json!(null)).is_none());
    }

    #[test]
    fn test_parse_timestamp_truncates_sub_millisecond_precision() {
        // Resume cursors carry epoch milliseconds; two updates inside the
        // same millisecond must parse to the same instant so neither can
        // land above a cursor cut between them.
        let earlier = parse_timestamp(&json!("2024-03-01T12:00:00.123200Z")).unwrap();
        let later = parse_timestamp(&json!("2024-03-01T12:00:00.123500Z")).unwrap();
        assert_eq!(earlier, later);
        assert_eq!(earlier.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(earlier.timestamp_millis(), 1_709_294_400_123);
    }

    #[test]
    fn test_parse_decimal_from_number() {
        assert_eq!(parse_decimal(&json!(12.5)), Some(Decimal::new(125, 1)));
        assert_eq!(parse_decimal(&json!("not a number")), None);
    }

    #[test]
    fn test_from_config_applies_fetch_timeout() {
        let mut config = EngineConfig::default();
        config.merge.fetch_timeout = Duration::from_secs(7);
        config.token.retry.max_attempts = 2;

        let client =
            HttpUpstreamClient::from_config(reqwest::Client::new(), "orders", &config);
        assert_eq!(client.request_timeout, Duration::from_secs(7));
        assert_eq!(client.retry.max_attempts(), 2);
        assert_eq!(client.collection, "orders");
    }
}
