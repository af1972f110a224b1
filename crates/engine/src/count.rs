//! Counting and caching layer.
//!
//! Exact full scans are correct but slow and burn vendor rate budget; quick
//! scans are cheap but can under-count. This layer trades latency for
//! correctness only as far as necessary - cache, then persisted snapshot,
//! then quick scan, then exact scan - and always labels the result's trust
//! level via `approx` so the dashboard can render it honestly.
//!
//! Every failure here degrades the result instead of propagating: cache and
//! snapshot-store errors are absorbed, per-shop scan failures contribute
//! zero with `approx = true`, budget overruns stop early with a partial
//! tally. The public surface is therefore infallible by design.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use tracing::{debug, info, instrument, warn};

use shopdeck_core::{CountScope, CounterSnapshot, OrderRecord, PendingSnapshot, ShopId};

use crate::cache::CacheStore;
use crate::config::CountConfig;
use crate::error::StoreError;
use crate::source::ShopSource;
use crate::upstream::PageParams;

/// Persisted aggregates and the out-of-band pending snapshot.
pub trait SnapshotStore: Send + Sync {
    /// Last persisted exact aggregate for a scope, if any.
    fn load_aggregate<'a>(
        &'a self,
        scope: &'a CountScope,
    ) -> BoxFuture<'a, Result<Option<CounterSnapshot>, StoreError>>;

    /// Persist an exact aggregate for future reuse.
    fn store_aggregate<'a>(
        &'a self,
        snapshot: &'a CounterSnapshot,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// The pending-orders snapshot the out-of-band worker maintains.
    fn load_pending<'a>(&'a self) -> BoxFuture<'a, Result<Option<PendingSnapshot>, StoreError>>;
}

/// Local transactional record store, reached through idempotent upserts and
/// aggregate queries. Correctness under concurrent writers relies on the
/// upserts being idempotent, not on locking.
pub trait OrderRepository: Send + Sync {
    /// Idempotent upsert keyed by vendor item ID.
    fn upsert<'a>(&'a self, record: &'a OrderRecord) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Count locally stored orders matching the filter.
    fn count<'a>(
        &'a self,
        scope: &'a CountScope,
        params: &'a PageParams,
    ) -> BoxFuture<'a, Result<CounterSnapshot, StoreError>>;

    /// Most recent locally observed update timestamp for the scope.
    fn latest_update<'a>(
        &'a self,
        scope: &'a CountScope,
    ) -> BoxFuture<'a, Result<Option<DateTime<Utc>>, StoreError>>;
}

/// Fire-and-forget trigger for an out-of-band reconciliation pass.
///
/// Implementations must not block; typically they notify a worker or spawn a
/// task and return immediately.
pub trait ReconcileHook: Send + Sync {
    /// Request a reconciliation for the scope.
    fn trigger(&self, scope: &CountScope);
}

/// Hook for deployments without a reconciliation worker.
pub struct NoopReconcileHook;

impl ReconcileHook for NoopReconcileHook {
    fn trigger(&self, scope: &CountScope) {
        debug!(scope = %scope, "reconciliation requested but no worker is wired");
    }
}

/// A count response plus how it was satisfied.
#[derive(Debug, Clone)]
pub struct CountResult {
    /// The counts themselves.
    pub snapshot: CounterSnapshot,
    /// True when served from cache without touching the vendor.
    pub cache_hit: bool,
}

/// Where a pending-orders headline figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCountSource {
    /// Fresh out-of-band worker snapshot.
    Snapshot,
    /// Live capped vendor scan.
    LiveScan,
    /// Last known database-derived count.
    Database,
}

/// The "pending orders" headline figure with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCount {
    /// Pending order total.
    pub total: u64,
    /// True when any fallback path produced the figure.
    pub approx: bool,
    /// Which rung of the fallback ladder answered.
    pub source: PendingCountSource,
    /// When the figure was produced.
    pub computed_at: DateTime<Utc>,
}

/// Aggregate count service over all configured shops.
///
/// Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct CountService {
    inner: Arc<CountServiceInner>,
}

struct CountServiceInner {
    source: ShopSource,
    cache: Arc<dyn CacheStore>,
    snapshots: Arc<dyn SnapshotStore>,
    repository: Arc<dyn OrderRepository>,
    reconcile: Arc<dyn ReconcileHook>,
    config: CountConfig,
}

impl CountService {
    /// Wire the service from its collaborators.
    #[must_use]
    pub fn new(
        source: ShopSource,
        cache: Arc<dyn CacheStore>,
        snapshots: Arc<dyn SnapshotStore>,
        repository: Arc<dyn OrderRepository>,
        reconcile: Arc<dyn ReconcileHook>,
        config: CountConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CountServiceInner {
                source,
                cache,
                snapshots,
                repository,
                reconcile,
                config,
            }),
        }
    }

    /// Aggregate counts for a scope.
    ///
    /// `ttl` controls how long the computed result stays cached (clamped to
    /// the configured maximum); `force` bypasses the cache read but still
    /// writes the fresh result back.
    #[instrument(skip(self), fields(scope = %scope, exact, force))]
    pub async fn get_count(
        &self,
        scope: &CountScope,
        exact: bool,
        ttl: Option<Duration>,
        force: bool,
    ) -> CountResult {
        let config = &self.inner.config;
        let ttl = ttl
            .unwrap_or(config.default_cache_ttl)
            .min(config.max_cache_ttl);
        let key = cache_key(scope, exact);

        if !force && let Some(snapshot) = self.cache_get(&key).await {
            debug!(key = %key, "count served from cache");
            return CountResult {
                snapshot,
                cache_hit: true,
            };
        }

        let snapshot = if exact {
            self.exact_count(scope).await
        } else {
            self.quick_count(scope).await
        };

        self.cache_put(&key, &snapshot, ttl).await;
        CountResult {
            snapshot,
            cache_hit: false,
        }
    }

    /// The "pending orders" headline figure.
    ///
    /// Prefers the out-of-band worker snapshot while it is fresh, then a
    /// live capped scan, then the last database-derived count. Also probes
    /// local staleness and fires a non-blocking reconciliation when the
    /// local copy has fallen too far behind.
    #[instrument(skip(self))]
    pub async fn pending_count(&self) -> PendingCount {
        self.maybe_trigger_reconcile().await;

        let config = &self.inner.config;
        let now = Utc::now();
        let max_age = chrono::Duration::seconds(config.pending_snapshot_max_age_secs);

        match self.inner.snapshots.load_pending().await {
            Ok(Some(snapshot)) if snapshot.is_fresh(max_age, now) => {
                debug!(
                    total = snapshot.total_orders,
                    "pending count served from worker snapshot"
                );
                return PendingCount {
                    total: snapshot.total_orders,
                    approx: false,
                    source: PendingCountSource::Snapshot,
                    computed_at: now,
                };
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "pending snapshot read failed"),
        }

        let params = PageParams::with_status(config.pending_status.clone());
        let shops = self.inner.source.shops();
        if !shops.is_empty() {
            let scans = shops.iter().map(|shop_id| {
                self.scan_shop(
                    shop_id,
                    &params,
                    Some(config.pending_scan_page_limit),
                    config.quick_budget,
                )
            });
            let mut sum = CounterSnapshot::empty(CountScope::All);
            for shop_counts in &join_all(scans).await {
                sum.absorb(shop_counts);
            }
            // Zero with a degradation flag means every shop failed, not that
            // the business is idle; fall through to the database.
            let all_failed = sum.total == 0 && sum.approx;
            if !all_failed {
                return PendingCount {
                    total: sum.total,
                    approx: sum.approx,
                    source: PendingCountSource::LiveScan,
                    computed_at: now,
                };
            }
            warn!("live pending scan failed for every shop; using database fallback");
        }

        match self.inner.repository.count(&CountScope::All, &params).await {
            Ok(local) => PendingCount {
                total: local.total,
                approx: true,
                source: PendingCountSource::Database,
                computed_at: now,
            },
            Err(e) => {
                warn!(error = %e, "database fallback for pending count failed");
                PendingCount {
                    total: 0,
                    approx: true,
                    source: PendingCountSource::Database,
                    computed_at: now,
                }
            }
        }
    }

    /// Quick bounded count for a scope.
    async fn quick_count(&self, scope: &CountScope) -> CounterSnapshot {
        let config = &self.inner.config;
        match scope {
            CountScope::Shop(shop_id) => {
                self.scan_shop(
                    shop_id,
                    &PageParams::default(),
                    Some(config.quick_page_limit),
                    config.quick_budget,
                )
                .await
            }
            CountScope::All => {
                let shops = self.inner.source.shops();
                if shops.is_empty() {
                    warn!("no shops configured; deferring to exact aggregate");
                    let mut snapshot = self.exact_count(&CountScope::All).await;
                    snapshot.approx = true;
                    return snapshot;
                }

                let params = PageParams::default();
                let scans = shops.iter().map(|shop_id| {
                    self.scan_shop(
                        shop_id,
                        &params,
                        Some(config.quick_page_limit),
                        config.quick_budget,
                    )
                });
                let mut sum = CounterSnapshot::empty(CountScope::All);
                for shop_counts in &join_all(scans).await {
                    sum.absorb(shop_counts);
                }
                sum.computed_at = Utc::now();

                if sum.total == 0 {
                    // A zero across every shop is more likely a failure than
                    // a truly empty account; verify the hard way, once.
                    debug!("quick all-shops scan summed to zero; verifying with exact scan");
                    return self.exact_count(&CountScope::All).await;
                }
                sum
            }
        }
    }

    /// Exact count for a scope, reusing a persisted aggregate when fresh.
    async fn exact_count(&self, scope: &CountScope) -> CounterSnapshot {
        let config = &self.inner.config;
        let reuse_age = chrono::Duration::seconds(config.exact_reuse_max_age_secs);

        match self.inner.snapshots.load_aggregate(scope).await {
            Ok(Some(snapshot)) if !snapshot.is_stale(reuse_age, Utc::now()) => {
                debug!(scope = %scope, "exact count served from persisted aggregate");
                return snapshot;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "snapshot store read failed; computing exact scan"),
        }

        let snapshot = match scope {
            CountScope::Shop(shop_id) => {
                self.scan_shop(shop_id, &PageParams::default(), None, config.exact_budget)
                    .await
            }
            CountScope::All => {
                let shops = self.inner.source.shops();
                let mut sum = CounterSnapshot::empty(CountScope::All);
                if shops.is_empty() {
                    sum.approx = true;
                } else {
                    let params = PageParams::default();
                    let scans = shops.iter().map(|shop_id| {
                        self.scan_shop(shop_id, &params, None, config.exact_budget)
                    });
                    for shop_counts in &join_all(scans).await {
                        sum.absorb(shop_counts);
                    }
                }
                sum.computed_at = Utc::now();
                sum
            }
        };

        // Only clean results are worth reusing later.
        if !snapshot.approx
            && let Err(e) = self.inner.snapshots.store_aggregate(&snapshot).await
        {
            warn!(error = %e, "failed to persist exact aggregate");
        }
        snapshot
    }

    /// Walk one shop's pages tallying counts, bounded by `page_limit` and a
    /// wall-clock `budget`. Failures and overruns stop the walk with a
    /// partial, `approx` tally.
    async fn scan_shop(
        &self,
        shop_id: &ShopId,
        params: &PageParams,
        page_limit: Option<u32>,
        budget: Duration,
    ) -> CounterSnapshot {
        let mut snapshot = CounterSnapshot::empty(CountScope::Shop(shop_id.clone()));
        let deadline = tokio::time::Instant::now() + budget;
        let page_size = self.inner.config.quick_page_size;
        let mut token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(shop_id = %shop_id, "count scan budget exhausted; result is approximate");
                snapshot.approx = true;
                break;
            }

            let fetch = self
                .inner
                .source
                .fetch(shop_id, params, page_size, token.as_deref());
            match tokio::time::timeout(remaining, fetch).await {
                Ok(Ok(page)) => {
                    pages += 1;
                    for item in &page.items {
                        snapshot.total += 1;
                        if let Some(status) = &item.status {
                            *snapshot.by_status.entry(status.clone()).or_insert(0) += 1;
                        }
                        if let Some(qc) = &item.qc_status {
                            *snapshot.by_qc_status.entry(qc.clone()).or_insert(0) += 1;
                        }
                    }
                    token = page.next_token;
                    if token.is_none() {
                        break;
                    }
                    if page_limit.is_some_and(|limit| pages >= limit) {
                        // More pages remain upstream than we are willing to
                        // walk; the tally under-counts.
                        snapshot.approx = true;
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(shop_id = %shop_id, error = %e, "count scan fetch failed; partial result");
                    snapshot.approx = true;
                    break;
                }
                Err(_) => {
                    warn!(shop_id = %shop_id, "count scan fetch timed out; partial result");
                    snapshot.approx = true;
                    break;
                }
            }
        }

        snapshot.computed_at = Utc::now();
        snapshot
    }

    /// Compare "now" against the newest locally observed update; when the
    /// gap exceeds the threshold, fire a non-blocking reconciliation instead
    /// of waiting for the next scheduled pass.
    async fn maybe_trigger_reconcile(&self) {
        let threshold =
            chrono::Duration::seconds(self.inner.config.staleness_threshold_secs);
        match self.inner.repository.latest_update(&CountScope::All).await {
            Ok(Some(latest)) => {
                let gap = Utc::now().signed_duration_since(latest);
                if gap > threshold {
                    info!(
                        gap_secs = gap.num_seconds(),
                        "local order data is stale; triggering reconciliation"
                    );
                    self.inner.reconcile.trigger(&CountScope::All);
                }
            }
            Ok(None) => {
                info!("no local order data observed yet; triggering reconciliation");
                self.inner.reconcile.trigger(&CountScope::All);
            }
            Err(e) => warn!(error = %e, "staleness probe failed"),
        }
    }

    async fn cache_get(&self, key: &str) -> Option<CounterSnapshot> {
        match self.inner.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(key, error = %e, "discarding undecodable cached count");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed; computing fresh");
                None
            }
        }
    }

    async fn cache_put(&self, key: &str, snapshot: &CounterSnapshot, ttl: Duration) {
        match serde_json::to_string(snapshot) {
            Ok(raw) => {
                if let Err(e) = self.inner.cache.set(key, raw, ttl).await {
                    warn!(key, error = %e, "cache write failed; result served uncached");
                }
            }
            Err(e) => warn!(key, error = %e, "count snapshot failed to serialize"),
        }
    }
}

fn cache_key(scope: &CountScope, exact: bool) -> String {
    let kind = if exact { "exact" } else { "quick" };
    format!("orders:count:{scope}:{kind}")
}
