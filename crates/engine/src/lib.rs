//! Shopdeck Cross-Shop Aggregation Engine.
//!
//! This crate is the algorithmic core behind the multi-shop operations
//! dashboard. It proxies an upstream marketplace vendor API (paginated
//! collections behind token auth) for many independent shop credentials and
//! presents them as one coherent surface:
//!
//! - [`token`] - mints short-lived bearer tokens from per-shop refresh
//!   credentials, de-duplicating concurrent refreshes and bounding total
//!   concurrent exchanges
//! - [`source`] - wraps one shop's collection endpoint as a uniform
//!   "fetch next page" operation
//! - [`merge`] - interleaves N per-shop page streams into one globally
//!   time-ordered, cursor-resumable sequence ("ALL shops" views)
//! - [`count`] - approximate-vs-exact order counters with an explicit
//!   freshness/staleness policy
//!
//! # Security
//!
//! This crate handles HIGH PRIVILEGE refresh credentials for every connected
//! shop. Credentials are wrapped in `SecretString` and never logged.
//!
//! The presentation layer, persistence engine, and cache store are external
//! collaborators reached through the traits in [`count`] and [`cache`].

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cache;
pub mod config;
pub mod count;
pub mod credentials;
pub mod cursor;
pub mod error;
pub mod merge;
pub mod retry;
pub mod source;
pub mod token;
pub mod upstream;

#[cfg(test)]
mod testutil;

pub use cache::{CacheStore, MemoryCache};
pub use config::{CountConfig, EngineConfig, MergeConfig, RetryConfig, TokenConfig};
pub use count::{
    CountResult, CountService, NoopReconcileHook, OrderRepository, PendingCount,
    PendingCountSource, ReconcileHook, SnapshotStore,
};
pub use credentials::{CredentialResolver, StaticCredentialResolver};
pub use cursor::MergeCursor;
pub use error::{AuthError, CacheError, MergeError, StoreError, UpstreamError};
pub use merge::{MergeEngine, MergedPage};
pub use retry::{RetryPolicy, Retryable};
pub use source::ShopSource;
pub use token::{HttpTokenExchanger, MintedToken, TokenExchanger, TokenManager};
pub use upstream::{HttpUpstreamClient, PageParams, UpstreamClient, UpstreamPage};
