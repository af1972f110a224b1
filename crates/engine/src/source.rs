//! Paginated source adapter.
//!
//! Combines the credential resolver, token manager, and upstream client into
//! the one operation the merge and counting layers consume: "fetch the next
//! page for this shop".

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::instrument;

use shopdeck_core::ShopId;

use crate::credentials::CredentialResolver;
use crate::error::{AuthError, UpstreamError};
use crate::token::TokenManager;
use crate::upstream::{PageParams, UpstreamClient, UpstreamPage};

/// Uniform per-shop page fetcher.
///
/// Cheap to clone; clones share the resolver, token manager, and HTTP
/// client.
#[derive(Clone)]
pub struct ShopSource {
    inner: Arc<ShopSourceInner>,
}

struct ShopSourceInner {
    resolver: Arc<dyn CredentialResolver>,
    tokens: TokenManager,
    upstream: Arc<dyn UpstreamClient>,
}

impl ShopSource {
    /// Wire a source from its collaborators.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn CredentialResolver>,
        tokens: TokenManager,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            inner: Arc::new(ShopSourceInner {
                resolver,
                tokens,
                upstream,
            }),
        }
    }

    /// Every configured shop, in a stable order.
    #[must_use]
    pub fn shops(&self) -> Vec<ShopId> {
        self.inner.resolver.all_shops()
    }

    /// Fetch one page for one shop, minting or reusing a token as needed.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError::Auth(CredentialMissing)` for unconfigured
    /// shops, any `AuthError` from token minting, or the upstream fetch
    /// failure. How a failure is treated (shop exhausted vs. aborted scan)
    /// is the caller's policy, not this adapter's.
    #[instrument(skip(self, params), fields(shop_id = %shop_id, page_size))]
    pub async fn fetch(
        &self,
        shop_id: &ShopId,
        params: &PageParams,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<UpstreamPage, UpstreamError> {
        let credential = self
            .inner
            .resolver
            .resolve(shop_id)
            .ok_or_else(|| AuthError::CredentialMissing(shop_id.clone()))?;

        let token = self.inner.tokens.get_token(&credential).await?;

        self.inner
            .upstream
            .fetch_page(
                &credential,
                params,
                page_size,
                page_token,
                token.access_token.expose_secret(),
            )
            .await
    }
}
