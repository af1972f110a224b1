//! Test harness for exercising the aggregation engine end to end.
//!
//! Wires a real [`ShopSource`] (credential resolver + token manager) over an
//! in-process scripted vendor, so tests cover the same code paths production
//! uses minus the network. In-memory doubles for the snapshot store and order
//! repository back the counting-layer tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use secrecy::SecretString;

use shopdeck_core::{
    CountScope, CounterSnapshot, ItemId, OrderRecord, PendingSnapshot, ShopCredential, ShopId,
};
use shopdeck_engine::config::{RetryConfig, TokenConfig};
use shopdeck_engine::count::{OrderRepository, ReconcileHook, SnapshotStore};
use shopdeck_engine::error::{AuthError, StoreError, UpstreamError};
use shopdeck_engine::{
    MintedToken, PageParams, ShopSource, StaticCredentialResolver, TokenExchanger, TokenManager,
    UpstreamClient, UpstreamPage,
};

/// Install a test-friendly tracing subscriber (idempotent).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// One shop's scripted page sequence.
pub struct VendorScript {
    /// Pre-chunked pages; continuation tokens are synthesized (`p1`, `p2`, ...).
    pub pages: Vec<Vec<OrderRecord>>,
    /// Fail the fetch that would return this page index (0-based).
    pub fail_at: Option<usize>,
}

impl VendorScript {
    #[must_use]
    pub fn pages(pages: Vec<Vec<OrderRecord>>) -> Self {
        Self {
            pages,
            fail_at: None,
        }
    }

    #[must_use]
    pub fn failing_at(pages: Vec<Vec<OrderRecord>>, index: usize) -> Self {
        Self {
            pages,
            fail_at: Some(index),
        }
    }
}

/// In-process vendor double serving scripted pages per shop.
pub struct TestVendor {
    scripts: HashMap<ShopId, VendorScript>,
    fetch_calls: AtomicUsize,
}

impl TestVendor {
    #[must_use]
    pub fn new(scripts: impl IntoIterator<Item = (ShopId, VendorScript)>) -> Self {
        Self {
            scripts: scripts.into_iter().collect(),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn shop_ids(&self) -> impl Iterator<Item = &ShopId> {
        self.scripts.keys()
    }

    fn page_for(
        &self,
        shop_id: &ShopId,
        page_token: Option<&str>,
    ) -> Result<UpstreamPage, UpstreamError> {
        let script = self
            .scripts
            .get(shop_id)
            .ok_or_else(|| UpstreamError::Fetch {
                shop_id: shop_id.clone(),
                status: 404,
                message: "unknown shop".to_string(),
                retry_after: None,
            })?;

        let index = match page_token {
            None => 0,
            Some(token) => token
                .strip_prefix('p')
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(usize::MAX),
        };

        if script.fail_at == Some(index) {
            return Err(UpstreamError::Fetch {
                shop_id: shop_id.clone(),
                status: 500,
                message: "scripted failure".to_string(),
                retry_after: None,
            });
        }

        let items = script.pages.get(index).cloned().unwrap_or_default();
        let next_token = if index + 1 < script.pages.len() {
            Some(format!("p{}", index + 1))
        } else {
            None
        };
        Ok(UpstreamPage { items, next_token })
    }
}

impl UpstreamClient for TestVendor {
    fn fetch_page<'a>(
        &'a self,
        credential: &'a ShopCredential,
        _params: &'a PageParams,
        _page_size: u32,
        page_token: Option<&'a str>,
        _bearer: &'a str,
    ) -> BoxFuture<'a, Result<UpstreamPage, UpstreamError>> {
        async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.page_for(&credential.shop_id, page_token)
        }
        .boxed()
    }
}

/// Exchanger that succeeds after a short yield, counting every exchange.
///
/// The yield widens the window in which concurrent callers can pile onto the
/// same in-flight exchange, which is exactly what the de-duplication tests
/// want to observe.
pub struct CountingExchanger {
    exchanges: AtomicUsize,
}

impl CountingExchanger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            exchanges: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

impl Default for CountingExchanger {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenExchanger for CountingExchanger {
    fn exchange<'a>(
        &'a self,
        credential: &'a ShopCredential,
    ) -> BoxFuture<'a, Result<MintedToken, AuthError>> {
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(MintedToken {
                access_token: SecretString::from(format!("token-{}", credential.client_id)),
                expires_at: Utc::now().timestamp() + 3600,
            })
        }
        .boxed()
    }
}

/// Everything a test needs to drive the engine against a scripted vendor.
pub struct Harness {
    pub source: ShopSource,
    pub vendor: Arc<TestVendor>,
    pub exchanger: Arc<CountingExchanger>,
}

/// Wire a [`ShopSource`] over scripted shops, with a credential per shop.
#[must_use]
pub fn harness(scripts: impl IntoIterator<Item = (ShopId, VendorScript)>) -> Harness {
    init_tracing();
    let vendor = Arc::new(TestVendor::new(scripts));
    let resolver = StaticCredentialResolver::new(
        vendor.shop_ids().map(|shop_id| credential(shop_id.as_str())),
    );
    let exchanger = Arc::new(CountingExchanger::new());
    let tokens = TokenManager::new(
        Arc::clone(&exchanger) as Arc<dyn TokenExchanger>,
        &TokenConfig {
            max_concurrent_exchanges: 1,
            expiry_margin_secs: 60,
            retry: RetryConfig {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        },
    );
    Harness {
        source: ShopSource::new(
            Arc::new(resolver),
            tokens,
            Arc::clone(&vendor) as Arc<dyn UpstreamClient>,
        ),
        vendor,
        exchanger,
    }
}

#[must_use]
pub fn credential(shop: &str) -> ShopCredential {
    ShopCredential {
        shop_id: ShopId::new(shop),
        client_id: format!("client-{shop}"),
        refresh_token: SecretString::from("refresh"),
        token_url: "https://vendor.example/oauth/token".to_string(),
        api_base: "https://vendor.example/api".to_string(),
        platform_tag: None,
    }
}

#[must_use]
pub fn order(shop: &str, id: &str, secs: i64) -> OrderRecord {
    order_with_status(shop, id, secs, None, None)
}

#[must_use]
pub fn order_with_status(
    shop: &str,
    id: &str,
    secs: i64,
    status: Option<&str>,
    qc_status: Option<&str>,
) -> OrderRecord {
    OrderRecord {
        item_id: ItemId::new(id),
        shop_id: ShopId::new(shop),
        status: status.map(String::from),
        qc_status: qc_status.map(String::from),
        total: None,
        updated_at: Utc.timestamp_opt(secs, 0).single().expect("valid ts"),
        raw: serde_json::json!({ "id": id }),
    }
}

/// In-memory snapshot store double.
#[derive(Default)]
pub struct MemorySnapshotStore {
    pub aggregate: Mutex<Option<CounterSnapshot>>,
    pub pending: Mutex<Option<PendingSnapshot>>,
    pub stored: Mutex<Vec<CounterSnapshot>>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn load_aggregate<'a>(
        &'a self,
        _scope: &'a CountScope,
    ) -> BoxFuture<'a, Result<Option<CounterSnapshot>, StoreError>> {
        async move { Ok(self.aggregate.lock().unwrap().clone()) }.boxed()
    }

    fn store_aggregate<'a>(
        &'a self,
        snapshot: &'a CounterSnapshot,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.stored.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
        .boxed()
    }

    fn load_pending<'a>(&'a self) -> BoxFuture<'a, Result<Option<PendingSnapshot>, StoreError>> {
        async move { Ok(self.pending.lock().unwrap().clone()) }.boxed()
    }
}

/// In-memory order repository keyed by vendor item ID.
#[derive(Default)]
pub struct MemoryRepository {
    records: Mutex<HashMap<ItemId, OrderRecord>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OrderRepository for MemoryRepository {
    fn upsert<'a>(&'a self, record: &'a OrderRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.records
                .lock()
                .unwrap()
                .insert(record.item_id.clone(), record.clone());
            Ok(())
        }
        .boxed()
    }

    fn count<'a>(
        &'a self,
        scope: &'a CountScope,
        params: &'a PageParams,
    ) -> BoxFuture<'a, Result<CounterSnapshot, StoreError>> {
        async move {
            let records = self.records.lock().unwrap();
            let mut snapshot = CounterSnapshot::empty(scope.clone());
            for record in records.values() {
                if let CountScope::Shop(shop_id) = scope
                    && record.shop_id != *shop_id
                {
                    continue;
                }
                if let Some(wanted) = &params.status
                    && record.status.as_ref() != Some(wanted)
                {
                    continue;
                }
                snapshot.total += 1;
                if let Some(status) = &record.status {
                    *snapshot.by_status.entry(status.clone()).or_insert(0) += 1;
                }
            }
            Ok(snapshot)
        }
        .boxed()
    }

    fn latest_update<'a>(
        &'a self,
        _scope: &'a CountScope,
    ) -> BoxFuture<'a, Result<Option<DateTime<Utc>>, StoreError>> {
        async move {
            let records = self.records.lock().unwrap();
            Ok(records.values().map(|record| record.updated_at).max())
        }
        .boxed()
    }
}

/// Reconcile hook that records every trigger.
#[derive(Default)]
pub struct RecordingReconcile {
    triggers: AtomicUsize,
}

impl RecordingReconcile {
    #[must_use]
    pub fn triggers(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }
}

impl ReconcileHook for RecordingReconcile {
    fn trigger(&self, _scope: &CountScope) {
        self.triggers.fetch_add(1, Ordering::SeqCst);
    }
}
