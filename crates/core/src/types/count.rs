//! Counter snapshots and scopes.
//!
//! Counts are either *quick* (bounded scan, may under-count) or *exact*
//! (full scan). Every snapshot carries an `approx` flag so consumers can
//! render the trust level honestly.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::id::ShopId;

/// Scope of a count: one shop, or all configured shops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CountScope {
    /// Aggregate across every configured shop.
    All,
    /// A single shop.
    Shop(ShopId),
}

impl fmt::Display for CountScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("ALL"),
            Self::Shop(id) => f.write_str(id.as_str()),
        }
    }
}

/// Aggregate order counts for a scope, with status breakdowns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Scope this snapshot covers.
    pub scope: CountScope,
    /// Total matching orders.
    pub total: u64,
    /// True if any fallback or partial-failure path contributed.
    pub approx: bool,
    /// Counts by vendor order status.
    pub by_status: BTreeMap<String, u64>,
    /// Counts by quality-control status.
    pub by_qc_status: BTreeMap<String, u64>,
    /// When the snapshot was computed.
    pub computed_at: DateTime<Utc>,
}

impl CounterSnapshot {
    /// An empty snapshot for the given scope, computed now.
    #[must_use]
    pub fn empty(scope: CountScope) -> Self {
        Self {
            scope,
            total: 0,
            approx: false,
            by_status: BTreeMap::new(),
            by_qc_status: BTreeMap::new(),
            computed_at: Utc::now(),
        }
    }

    /// Fold another scope's counts into this one.
    ///
    /// Totals and breakdowns are summed; approximateness is sticky.
    pub fn absorb(&mut self, other: &Self) {
        self.total += other.total;
        self.approx |= other.approx;
        for (status, n) in &other.by_status {
            *self.by_status.entry(status.clone()).or_insert(0) += n;
        }
        for (status, n) in &other.by_qc_status {
            *self.by_qc_status.entry(status.clone()).or_insert(0) += n;
        }
    }

    /// Whether the snapshot is older than `max_age`.
    #[must_use]
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.computed_at) > max_age
    }
}

/// Periodically recomputed "pending orders" aggregate.
///
/// Written by an out-of-band worker; read by the counting layer as a
/// freshness oracle so the headline figure rarely needs a live vendor scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    /// Pending order count found by the worker.
    pub total_orders: u64,
    /// Pages the worker walked to produce the count.
    pub total_pages: u32,
    /// Whether the worker run completed without error.
    pub ok: bool,
    /// When the worker run started.
    pub started_at: DateTime<Utc>,
    /// When the worker run finished, if it did.
    pub completed_at: Option<DateTime<Utc>>,
    /// Lookback window the worker scanned, in days.
    pub window_days: u32,
    /// Error message from a failed run.
    pub error: Option<String>,
}

impl PendingSnapshot {
    /// Whether this snapshot is a trustworthy substitute for a live scan.
    ///
    /// Requires a successful, completed run no older than `max_age`.
    #[must_use]
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.ok
            && self
                .completed_at
                .is_some_and(|done| now.signed_duration_since(done) <= max_age)
    }
}
