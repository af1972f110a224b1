//! Cache store abstraction for counter snapshots.
//!
//! Any key/value store with `get`/`set`+TTL semantics can back the counting
//! layer; deployments typically point this at a shared store, while the
//! bundled [`MemoryCache`] (moka) serves single-process setups and tests.
//! Writers do not coordinate beyond last-write-wins on a key.

use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use moka::Expiry;
use moka::future::Cache;

use crate::error::CacheError;

/// Generic key/value cache with per-entry TTL.
pub trait CacheStore: Send + Sync {
    /// Read a value, `None` on miss or expiry.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>>;

    /// Write a value that expires after `ttl`.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Reads the TTL each entry was stored with.
struct PerEntryTtl;

impl Expiry<String, (String, Duration)> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &(String, Duration),
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.1)
    }
}

/// In-process `CacheStore` backed by moka.
#[derive(Clone)]
pub struct MemoryCache {
    cache: Cache<String, (String, Duration)>,
}

impl MemoryCache {
    /// Create a cache holding at most `max_capacity` entries.
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl CacheStore for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        async move { Ok(self.cache.get(key).await.map(|(value, _)| value)) }.boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        async move {
            self.cache.insert(key.to_string(), (value, ttl)).await;
            Ok(())
        }
        .boxed()
    }
}
