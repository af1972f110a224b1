//! Shared fixtures for engine tests: a scripted upstream, a stub token
//! exchanger, and record builders.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use secrecy::SecretString;

use shopdeck_core::{ItemId, OrderRecord, ShopCredential, ShopId};

use crate::config::TokenConfig;
use crate::credentials::StaticCredentialResolver;
use crate::error::{AuthError, UpstreamError};
use crate::source::ShopSource;
use crate::token::{MintedToken, TokenExchanger, TokenManager};
use crate::upstream::{PageParams, UpstreamClient, UpstreamPage};

/// Exchanger that always succeeds with a long-lived token.
pub struct StubExchanger {
    pub calls: AtomicUsize,
}

impl StubExchanger {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl TokenExchanger for StubExchanger {
    fn exchange<'a>(
        &'a self,
        _credential: &'a ShopCredential,
    ) -> BoxFuture<'a, Result<MintedToken, AuthError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MintedToken {
                access_token: SecretString::from("stub-token"),
                expires_at: Utc::now().timestamp() + 3600,
            })
        }
        .boxed()
    }
}

/// One shop's scripted page sequence.
pub struct ShopScript {
    /// Pre-chunked pages; continuation tokens are synthesized (`p1`, `p2`, ...).
    pub pages: Vec<Vec<OrderRecord>>,
    /// Fail the fetch that would return this page index (0-based).
    pub fail_at: Option<usize>,
}

impl ShopScript {
    pub fn pages(pages: Vec<Vec<OrderRecord>>) -> Self {
        Self {
            pages,
            fail_at: None,
        }
    }

    pub fn failing_at(pages: Vec<Vec<OrderRecord>>, index: usize) -> Self {
        Self {
            pages,
            fail_at: Some(index),
        }
    }
}

/// Upstream client serving scripted pages per shop.
pub struct ScriptedUpstream {
    scripts: HashMap<ShopId, ShopScript>,
    pub fetch_calls: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new(scripts: impl IntoIterator<Item = (ShopId, ShopScript)>) -> Self {
        Self {
            scripts: scripts.into_iter().collect(),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
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

impl UpstreamClient for ScriptedUpstream {
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

pub fn order(shop: &str, id: &str, secs: i64) -> OrderRecord {
    order_with_status(shop, id, secs, None, None)
}

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

/// Wire a `ShopSource` over a scripted upstream, with credentials for every
/// scripted shop.
pub fn source_over(upstream: Arc<ScriptedUpstream>) -> ShopSource {
    let resolver = StaticCredentialResolver::new(
        upstream
            .scripts
            .keys()
            .map(|shop_id| credential(shop_id.as_str())),
    );
    let tokens = TokenManager::new(
        Arc::new(StubExchanger::new()),
        &TokenConfig {
            max_concurrent_exchanges: 4,
            expiry_margin_secs: 60,
            retry: crate::config::RetryConfig {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        },
    );
    ShopSource::new(Arc::new(resolver), tokens, upstream)
}
