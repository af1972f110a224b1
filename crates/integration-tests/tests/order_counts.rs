//! Counting layer wired with the real source, in-process cache, and
//! in-memory store doubles.

use std::sync::Arc;

use chrono::Utc;
use shopdeck_core::{CountScope, PendingSnapshot, ShopId};
use shopdeck_engine::count::{OrderRepository, PendingCountSource, ReconcileHook, SnapshotStore};
use shopdeck_engine::{CountConfig, CountService, MemoryCache};
use shopdeck_integration_tests::{
    Harness, MemoryRepository, MemorySnapshotStore, RecordingReconcile, VendorScript, harness,
    order, order_with_status,
};

struct CountFixture {
    service: CountService,
    harness: Harness,
    snapshots: Arc<MemorySnapshotStore>,
    repository: Arc<MemoryRepository>,
    reconcile: Arc<RecordingReconcile>,
}

fn count_fixture(scripts: Vec<(ShopId, VendorScript)>) -> CountFixture {
    let h = harness(scripts);
    let snapshots = Arc::new(MemorySnapshotStore::default());
    let repository = Arc::new(MemoryRepository::default());
    let reconcile = Arc::new(RecordingReconcile::default());
    let service = CountService::new(
        h.source.clone(),
        Arc::new(MemoryCache::new(64)),
        Arc::clone(&snapshots) as Arc<dyn SnapshotStore>,
        Arc::clone(&repository) as Arc<dyn OrderRepository>,
        Arc::clone(&reconcile) as Arc<dyn ReconcileHook>,
        CountConfig::default(),
    );
    CountFixture {
        service,
        harness: h,
        snapshots,
        repository,
        reconcile,
    }
}

fn pending_page(shop: &str, n: usize) -> Vec<shopdeck_core::OrderRecord> {
    (0..n)
        .map(|i| {
            order_with_status(
                shop,
                &format!("{shop}-p{i}"),
                1_000 + i as i64,
                Some("PENDING"),
                None,
            )
        })
        .collect()
}

#[tokio::test]
async fn test_quick_count_sums_across_shops_and_caches() {
    let fx = count_fixture(vec![
        (
            ShopId::new("alpha"),
            VendorScript::pages(vec![pending_page("alpha", 4)]),
        ),
        (
            ShopId::new("beta"),
            VendorScript::pages(vec![pending_page("beta", 6)]),
        ),
    ]);

    let first = fx
        .service
        .get_count(&CountScope::All, false, None, false)
        .await;
    assert!(!first.cache_hit);
    assert_eq!(first.snapshot.total, 10);
    assert_eq!(first.snapshot.by_status.get("PENDING"), Some(&10));
    let calls = fx.harness.vendor.fetch_calls();

    let second = fx
        .service
        .get_count(&CountScope::All, false, None, false)
        .await;
    assert!(second.cache_hit);
    assert_eq!(second.snapshot.total, 10);
    assert_eq!(fx.harness.vendor.fetch_calls(), calls);
}

#[tokio::test]
async fn test_exact_count_walks_every_page_and_persists_aggregate() {
    let fx = count_fixture(vec![(
        ShopId::new("alpha"),
        VendorScript::pages(vec![pending_page("alpha", 3), pending_page("alpha", 2)]),
    )]);

    let result = fx
        .service
        .get_count(&CountScope::Shop(ShopId::new("alpha")), true, None, false)
        .await;
    assert_eq!(result.snapshot.total, 5);
    assert!(!result.snapshot.approx);
    assert_eq!(fx.snapshots.stored.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_shop_yields_approximate_count() {
    let fx = count_fixture(vec![
        (
            ShopId::new("alpha"),
            VendorScript::pages(vec![pending_page("alpha", 4)]),
        ),
        (
            ShopId::new("broken"),
            VendorScript::failing_at(vec![pending_page("broken", 9)], 0),
        ),
    ]);

    let result = fx
        .service
        .get_count(&CountScope::All, false, None, false)
        .await;
    assert_eq!(result.snapshot.total, 4);
    assert!(result.snapshot.approx);
}

#[tokio::test]
async fn test_pending_count_prefers_fresh_snapshot_over_live_scan() {
    let fx = count_fixture(vec![(
        ShopId::new("alpha"),
        VendorScript::pages(vec![pending_page("alpha", 4)]),
    )]);
    *fx.snapshots.pending.lock().unwrap() = Some(PendingSnapshot {
        total_orders: 21,
        total_pages: 2,
        ok: true,
        started_at: Utc::now(),
        completed_at: Some(Utc::now()),
        window_days: 7,
        error: None,
    });

    let pending = fx.service.pending_count().await;
    assert_eq!(pending.total, 21);
    assert_eq!(pending.source, PendingCountSource::Snapshot);
    assert!(!pending.approx);
    assert_eq!(fx.harness.vendor.fetch_calls(), 0);
}

#[tokio::test]
async fn test_pending_count_falls_back_to_live_scan() {
    let fx = count_fixture(vec![(
        ShopId::new("alpha"),
        VendorScript::pages(vec![pending_page("alpha", 4)]),
    )]);

    let pending = fx.service.pending_count().await;
    assert_eq!(pending.total, 4);
    assert_eq!(pending.source, PendingCountSource::LiveScan);
}

#[tokio::test]
async fn test_pending_count_uses_repository_when_vendor_is_down() {
    let fx = count_fixture(vec![(
        ShopId::new("alpha"),
        VendorScript::failing_at(vec![pending_page("alpha", 4)], 0),
    )]);
    for record in pending_page("alpha", 7) {
        fx.repository.upsert(&record).await.unwrap();
    }

    let pending = fx.service.pending_count().await;
    assert_eq!(pending.total, 7);
    assert_eq!(pending.source, PendingCountSource::Database);
    assert!(pending.approx);
}

#[tokio::test]
async fn test_empty_repository_triggers_reconcile() {
    let fx = count_fixture(vec![(
        ShopId::new("alpha"),
        VendorScript::pages(vec![pending_page("alpha", 1)]),
    )]);
    assert!(fx.repository.is_empty());

    fx.service.pending_count().await;
    assert_eq!(fx.reconcile.triggers(), 1);
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let repository = MemoryRepository::default();
    let record = order("alpha", "a-1", 700);

    repository.upsert(&record).await.unwrap();
    repository.upsert(&record).await.unwrap();
    let mut updated = record.clone();
    updated.status = Some("SHIPPED".to_string());
    repository.upsert(&updated).await.unwrap();

    assert_eq!(repository.len(), 1);
    let snapshot = repository
        .count(&CountScope::All, &shopdeck_engine::PageParams::default())
        .await
        .unwrap();
    assert_eq!(snapshot.by_status.get("SHIPPED"), Some(&1));
}
