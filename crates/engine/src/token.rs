//! Token management for upstream vendor credentials.
//!
//! Many components across many shops race to mint bearer tokens. Without
//! per-identity de-duplication and a global concurrency cap the vendor's
//! token endpoint gets hammered and rate-limited. The manager therefore:
//!
//! - caches minted tokens per credential identity, with a safety margin so a
//!   token is never handed out right before it expires mid-request
//! - keeps an in-flight registry of shared exchange futures, so N concurrent
//!   callers for the same identity perform exactly one network exchange
//! - bounds concurrent exchanges across *all* identities with a semaphore
//! - retries 429/5xx responses with jittered backoff via [`RetryPolicy`]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use shopdeck_core::ShopCredential;

use crate::config::TokenConfig;
use crate::error::AuthError;
use crate::retry::{RetryPolicy, Retryable, is_retryable_status};

/// Cap on error-body bytes kept for diagnostics.
const ERROR_BODY_LIMIT: usize = 512;

/// A short-lived bearer token minted from a refresh credential.
#[derive(Debug, Clone)]
pub struct MintedToken {
    /// Bearer token for API requests.
    pub access_token: SecretString,
    /// Unix timestamp when the token expires.
    pub expires_at: i64,
}

impl MintedToken {
    /// Whether the token is still usable at `now`, leaving `margin_secs`
    /// of headroom before actual expiry.
    #[must_use]
    pub const fn is_valid(&self, margin_secs: i64, now: i64) -> bool {
        now < self.expires_at - margin_secs
    }
}

impl Retryable for AuthError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Exchange { status, .. } => is_retryable_status(*status),
            Self::CredentialMissing(_) | Self::Transport(_) | Self::Timeout(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Exchange { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// One network exchange of a refresh credential for a bearer token.
///
/// Abstracted so tests can count exchanges; production uses
/// [`HttpTokenExchanger`].
pub trait TokenExchanger: Send + Sync {
    /// Perform a single exchange attempt (no retries, no caching).
    fn exchange<'a>(
        &'a self,
        credential: &'a ShopCredential,
    ) -> BoxFuture<'a, Result<MintedToken, AuthError>>;
}

/// Successful token endpoint response.
#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    /// Token lifetime in seconds.
    expires_in: i64,
}

/// `TokenExchanger` over the vendor's OAuth-style refresh grant.
pub struct HttpTokenExchanger {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpTokenExchanger {
    /// Create an exchanger with the given per-request timeout.
    #[must_use]
    pub fn new(client: reqwest::Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    async fn exchange_once(&self, credential: &ShopCredential) -> Result<MintedToken, AuthError> {
        let now = Utc::now().timestamp();

        let request = self
            .client
            .post(&credential.token_url)
            .form(&[
                ("client_id", credential.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", credential.refresh_token.expose_secret()),
            ])
            .send();

        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| AuthError::Timeout(self.request_timeout))?
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs);
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(ERROR_BODY_LIMIT);
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }

        let parsed: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Transport(format!("invalid token response: {e}")))?;

        Ok(MintedToken {
            access_token: SecretString::from(parsed.access_token),
            expires_at: now + parsed.expires_in,
        })
    }
}

impl TokenExchanger for HttpTokenExchanger {
    fn exchange<'a>(
        &'a self,
        credential: &'a ShopCredential,
    ) -> BoxFuture<'a, Result<MintedToken, AuthError>> {
        self.exchange_once(credential).boxed()
    }
}

type ExchangeFuture = Shared<BoxFuture<'static, Result<MintedToken, AuthError>>>;

/// Process-wide token cache and exchange coordinator.
///
/// Cheap to clone; clones share the cache, in-flight registry, and
/// concurrency gate.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenManagerInner>,
}

struct TokenManagerInner {
    exchanger: Arc<dyn TokenExchanger>,
    retry: RetryPolicy,
    expiry_margin_secs: i64,
    /// Minted tokens by credential identity.
    cache: Mutex<HashMap<String, MintedToken>>,
    /// At most one exchange future per identity at any time.
    in_flight: Mutex<HashMap<String, ExchangeFuture>>,
    /// Bounds concurrent exchanges across all identities.
    permits: Arc<Semaphore>,
}

impl TokenManager {
    /// Create a manager around an exchanger.
    #[must_use]
    pub fn new(exchanger: Arc<dyn TokenExchanger>, config: &TokenConfig) -> Self {
        Self {
            inner: Arc::new(TokenManagerInner {
                exchanger,
                retry: RetryPolicy::new(&config.retry),
                expiry_margin_secs: config.expiry_margin_secs,
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(config.max_concurrent_exchanges.max(1))),
            }),
        }
    }

    /// Get a usable bearer token for the credential, minting one if the
    /// cached token is absent or within the expiry safety margin.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CredentialMissing` for incomplete bundles and
    /// `AuthError::Exchange`/`Transport`/`Timeout` when minting fails after
    /// retries. Never returns a stale or empty token.
    #[instrument(skip(self, credential), fields(shop_id = %credential.shop_id))]
    pub async fn get_token(&self, credential: &ShopCredential) -> Result<MintedToken, AuthError> {
        if !credential.is_complete() {
            return Err(AuthError::CredentialMissing(credential.shop_id.clone()));
        }

        let identity = credential.identity();
        let now = Utc::now().timestamp();

        if let Some(token) = self.cached(&identity)
            && token.is_valid(self.inner.expiry_margin_secs, now)
        {
            return Ok(token);
        }

        self.join_or_start_exchange(identity, credential.clone())
            .await
    }

    /// Drop any cached token for the credential, forcing the next call to
    /// mint a fresh one (used after an upstream 401).
    pub fn invalidate(&self, credential: &ShopCredential) {
        let identity = credential.identity();
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&identity);
        debug!(identity = %identity, "invalidated cached token");
    }

    fn cached(&self, identity: &str) -> Option<MintedToken> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Join the identity's in-flight exchange, or start one if none exists.
    ///
    /// The registry entry is removed when the exchange settles (success or
    /// failure) so a later call can retry.
    async fn join_or_start_exchange(
        &self,
        identity: String,
        credential: ShopCredential,
    ) -> Result<MintedToken, AuthError> {
        let future = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(existing) = in_flight.get(&identity) {
                debug!(identity = %identity, "joining in-flight token exchange");
                existing.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let id = identity.clone();
                let future: ExchangeFuture = async move {
                    let result = inner.mint(&credential).await;
                    inner
                        .in_flight
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                    match &result {
                        Ok(token) => {
                            inner
                                .cache
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(id, token.clone());
                        }
                        Err(e) => {
                            warn!(error = %e, "token exchange failed");
                        }
                    }
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(identity, future.clone());
                future
            }
        };

        future.await
    }
}

impl TokenManagerInner {
    /// Acquire a concurrency permit, then exchange with retries. The permit
    /// is released when the guard drops, failure paths included.
    async fn mint(&self, credential: &ShopCredential) -> Result<MintedToken, AuthError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AuthError::Transport("exchange gate closed".to_string()))?;

        let exchanger = Arc::clone(&self.exchanger);
        self.retry
            .run(|_attempt| {
                let exchanger = Arc::clone(&exchanger);
                let credential = credential.clone();
                async move { exchanger.exchange(&credential).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use shopdeck_core::ShopId;

    use crate::config::RetryConfig;

    struct MockExchanger {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        expires_in: i64,
        fail_attempts: usize,
        delay: Duration,
    }

    impl MockExchanger {
        fn new(expires_in: i64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                expires_in,
                fail_attempts: 0,
                delay: Duration::from_millis(20),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenExchanger for MockExchanger {
        fn exchange<'a>(
            &'a self,
            _credential: &'a ShopCredential,
        ) -> BoxFuture<'a, Result<MintedToken, AuthError>> {
            async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if call <= self.fail_attempts {
                    return Err(AuthError::Exchange {
                        status: 403,
                        body: "invalid_grant".to_string(),
                        retry_after: None,
                    });
                }
                Ok(MintedToken {
                    access_token: SecretString::from(format!("tok-{call}")),
                    expires_at: Utc::now().timestamp() + self.expires_in,
                })
            }
            .boxed()
        }
    }

    fn credential(shop: &str, client: &str) -> ShopCredential {
        ShopCredential {
            shop_id: ShopId::new(shop),
            client_id: client.to_string(),
            refresh_token: SecretString::from("refresh"),
            token_url: "https://vendor.example/oauth/token".to_string(),
            api_base: "https://vendor.example/api".to_string(),
            platform_tag: None,
        }
    }

    fn manager(exchanger: Arc<MockExchanger>, concurrency: usize) -> TokenManager {
        TokenManager::new(
            exchanger,
            &TokenConfig {
                max_concurrent_exchanges: concurrency,
                expiry_margin_secs: 60,
                retry: RetryConfig {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            },
        )
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let exchanger = Arc::new(MockExchanger::new(3600));
        let manager = manager(Arc::clone(&exchanger), 4);
        let cred = credential("s1", "client-a");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let cred = cred.clone();
            handles.push(tokio::spawn(async move { manager.get_token(&cred).await }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(exchanger.calls(), 1);
        let first = tokens[0].access_token.expose_secret().to_string();
        assert!(
            tokens
                .iter()
                .all(|t| t.access_token.expose_secret() == first)
        );
    }

    #[tokio::test]
    async fn test_expiry_margin_triggers_refresh() {
        // Token valid for only 30s sits inside the 60s margin: second call
        // must re-exchange.
        let exchanger = Arc::new(MockExchanger::new(30));
        let manager = manager(Arc::clone(&exchanger), 1);
        let cred = credential("s1", "client-a");

        manager.get_token(&cred).await.unwrap();
        manager.get_token(&cred).await.unwrap();
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn test_token_outside_margin_is_reused() {
        let exchanger = Arc::new(MockExchanger::new(120));
        let manager = manager(Arc::clone(&exchanger), 1);
        let cred = credential("s1", "client-a");

        let first = manager.get_token(&cred).await.unwrap();
        let second = manager.get_token(&cred).await.unwrap();
        assert_eq!(exchanger.calls(), 1);
        assert_eq!(
            first.access_token.expose_secret(),
            second.access_token.expose_secret()
        );
    }

    #[tokio::test]
    async fn test_incomplete_credentials_rejected_without_io() {
        let exchanger = Arc::new(MockExchanger::new(3600));
        let manager = manager(Arc::clone(&exchanger), 1);
        let mut cred = credential("s1", "client-a");
        cred.refresh_token = SecretString::from("");

        let err = manager.get_token(&cred).await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialMissing(_)));
        assert_eq!(exchanger.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_exchange_clears_in_flight_slot() {
        // 403 is fatal (not retried); the next call must start a fresh
        // exchange rather than observing a poisoned registry entry.
        let mut mock = MockExchanger::new(3600);
        mock.fail_attempts = 1;
        let exchanger = Arc::new(mock);
        let manager = manager(Arc::clone(&exchanger), 1);
        let cred = credential("s1", "client-a");

        assert!(manager.get_token(&cred).await.is_err());
        let token = manager.get_token(&cred).await.unwrap();
        assert_eq!(exchanger.calls(), 2);
        assert_eq!(token.access_token.expose_secret(), "tok-2");
    }

    #[tokio::test]
    async fn test_global_gate_serializes_distinct_identities() {
        let exchanger = Arc::new(MockExchanger::new(3600));
        let manager = manager(Arc::clone(&exchanger), 1);

        let a = credential("s1", "client-a");
        let b = credential("s2", "client-b");

        let (ra, rb) = tokio::join!(manager.get_token(&a), manager.get_token(&b));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(exchanger.calls(), 2);
        assert_eq!(exchanger.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_exchange() {
        let exchanger = Arc::new(MockExchanger::new(3600));
        let manager = manager(Arc::clone(&exchanger), 1);
        let cred = credential("s1", "client-a");

        manager.get_token(&cred).await.unwrap();
        manager.invalidate(&cred);
        manager.get_token(&cred).await.unwrap();
        assert_eq!(exchanger.calls(), 2);
    }
}
