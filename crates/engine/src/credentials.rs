//! Credential resolution.
//!
//! Maps a logical shop identifier to its upstream credential bundle. The
//! bundles themselves live in configuration storage owned by the outer
//! application; the engine only ever reads them.

use std::collections::HashMap;

use shopdeck_core::{ShopCredential, ShopId};

/// Read-only lookup from shop ID to upstream credentials.
pub trait CredentialResolver: Send + Sync {
    /// Credentials for one shop, if it is configured.
    fn resolve(&self, shop_id: &ShopId) -> Option<ShopCredential>;

    /// Every configured shop, in a stable order.
    fn all_shops(&self) -> Vec<ShopId>;
}

/// Resolver over a fixed in-memory set of credentials.
///
/// The production deployment loads this once per sync cycle from config
/// storage; tests build it directly.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialResolver {
    shops: HashMap<ShopId, ShopCredential>,
}

impl StaticCredentialResolver {
    /// Build a resolver from credential bundles.
    ///
    /// Later duplicates of the same shop ID win, matching config-overlay
    /// semantics.
    #[must_use]
    pub fn new(credentials: impl IntoIterator<Item = ShopCredential>) -> Self {
        let shops = credentials
            .into_iter()
            .map(|credential| (credential.shop_id.clone(), credential))
            .collect();
        Self { shops }
    }

    /// Number of configured shops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shops.len()
    }

    /// Whether no shops are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shops.is_empty()
    }
}

impl CredentialResolver for StaticCredentialResolver {
    fn resolve(&self, shop_id: &ShopId) -> Option<ShopCredential> {
        self.shops.get(shop_id).cloned()
    }

    fn all_shops(&self) -> Vec<ShopId> {
        let mut ids: Vec<ShopId> = self.shops.keys().cloned().collect();
        ids.sort();
        ids
    }
}
