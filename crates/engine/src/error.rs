//! Error taxonomy for the aggregation engine.
//!
//! Propagation policy:
//! - per-shop failures never abort a multi-shop operation; they degrade the
//!   result and set its `approx`/`is_partial` flag
//! - single-shop, single-call operations propagate errors to the caller
//! - cache and snapshot-store failures are always absorbed locally (logged,
//!   then bypassed)

use std::time::Duration;

use thiserror::Error;

use shopdeck_core::ShopId;

/// Errors from the token manager.
///
/// `Clone` because one in-flight exchange is shared by every concurrent
/// caller of the same credential identity; each of them receives the result.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// A shop lacks usable credentials. Skipped in multi-shop operations,
    /// surfaced directly otherwise.
    #[error("Missing or incomplete credentials for shop {0}")]
    CredentialMissing(ShopId),

    /// Token exchange rejected after exhausting retries.
    #[error("Token exchange failed with status {status}: {body}")]
    Exchange {
        /// HTTP status from the token endpoint.
        status: u16,
        /// Response body (truncated).
        body: String,
        /// `Retry-After` hint from a 429 response, if any.
        retry_after: Option<Duration>,
    },

    /// Network-level failure talking to the token endpoint.
    #[error("Token exchange transport error: {0}")]
    Transport(String),

    /// The exchange exceeded its wall-clock budget.
    #[error("Token exchange timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from upstream collection fetches.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The vendor rejected a page fetch.
    #[error("Fetch failed for shop {shop_id} with status {status}: {message}")]
    Fetch {
        /// Shop whose fetch failed.
        shop_id: ShopId,
        /// HTTP status from the collection endpoint.
        status: u16,
        /// Response body (truncated).
        message: String,
        /// `Retry-After` hint from a 429 response, if any.
        retry_after: Option<Duration>,
    },

    /// Network-level failure talking to the collection endpoint.
    #[error("Transport error for shop {shop_id}: {message}")]
    Transport {
        /// Shop whose fetch failed.
        shop_id: ShopId,
        /// Underlying transport error.
        message: String,
    },

    /// The response body did not match any recognized envelope shape.
    #[error("Malformed upstream envelope for shop {shop_id}: {message}")]
    Envelope {
        /// Shop whose response was malformed.
        shop_id: ShopId,
        /// What was wrong with the envelope.
        message: String,
    },

    /// A page fetch exceeded its wall-clock budget.
    #[error("Fetch for shop {shop_id} timed out after {timeout:?}")]
    Timeout {
        /// Shop whose fetch timed out.
        shop_id: ShopId,
        /// Budget that was exceeded.
        timeout: Duration,
    },

    /// Token minting for the shop failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl UpstreamError {
    /// The shop this error is attributed to, when it carries one.
    #[must_use]
    pub fn shop_id(&self) -> Option<&ShopId> {
        match self {
            Self::Fetch { shop_id, .. }
            | Self::Transport { shop_id, .. }
            | Self::Envelope { shop_id, .. }
            | Self::Timeout { shop_id, .. } => Some(shop_id),
            Self::Auth(AuthError::CredentialMissing(shop_id)) => Some(shop_id),
            Self::Auth(_) => None,
        }
    }
}

/// Errors from the cross-shop merge.
///
/// Per-shop fetch failures are *not* represented here; the merge absorbs them
/// and reports a partial page instead.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The resume cursor could not be decoded or has an unsupported version.
    #[error("Invalid resume cursor: {0}")]
    BadCursor(String),

    /// The request named no shops at all.
    #[error("No shops matched the requested scope")]
    NoShops,
}

/// Cache store unreachable or misbehaving. Always non-fatal: logged and
/// bypassed by the counting layer.
#[derive(Debug, Clone, Error)]
#[error("Cache unavailable: {0}")]
pub struct CacheError(pub String);

/// Snapshot store or repository failure. Absorbed by the counting layer
/// wherever a degraded result has value.
#[derive(Debug, Clone, Error)]
#[error("Store error: {0}")]
pub struct StoreError(pub String);
