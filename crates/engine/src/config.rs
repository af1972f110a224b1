//! Engine configuration loaded from environment variables.
//!
//! Every variable is optional; defaults match the production tuning the
//! dashboard ships with.
//!
//! # Environment Variables
//!
//! ## Token manager
//! - `SHOPDECK_TOKEN_CONCURRENCY` - Max concurrent token exchanges across all
//!   credentials (default: 1)
//! - `SHOPDECK_TOKEN_EXPIRY_MARGIN_SECS` - Safety margin before token expiry
//!   (default: 60)
//! - `SHOPDECK_RETRY_MAX_ATTEMPTS` - Attempt ceiling for retryable HTTP
//!   failures (default: 4)
//!
//! ## Merge engine
//! - `SHOPDECK_MERGE_REFILL_LIMIT` - Extra page fetches allowed per shop when
//!   resuming from a cursor empties a buffer (default: 5)
//! - `SHOPDECK_FETCH_TIMEOUT_SECS` - Per-request timeout for page fetches
//!   (default: 20)
//!
//! ## Counting layer
//! - `SHOPDECK_QUICK_PAGE_LIMIT` - Page cap for quick scans (default: 3)
//! - `SHOPDECK_QUICK_PAGE_SIZE` - Page size for counting scans (default: 100)
//! - `SHOPDECK_QUICK_BUDGET_SECS` - Wall-clock budget for a quick scan
//!   (default: 10)
//! - `SHOPDECK_EXACT_BUDGET_SECS` - Wall-clock budget for an exact scan
//!   (default: 120)
//! - `SHOPDECK_COUNT_TTL_SECS` - Default cache TTL for counts (default: 300)
//! - `SHOPDECK_COUNT_MAX_TTL_SECS` - Ceiling any requested TTL is clamped to
//!   (default: 3600)
//! - `SHOPDECK_PENDING_SNAPSHOT_MAX_AGE_SECS` - Max age at which the
//!   out-of-band pending snapshot is still trusted (default: 600)
//! - `SHOPDECK_PENDING_SCAN_PAGE_LIMIT` - Page cap for the live pending scan
//!   fallback (default: 3)
//! - `SHOPDECK_STALENESS_THRESHOLD_SECS` - Local-data age that triggers a
//!   background reconciliation (default: 1800)

use std::time::Duration;

use thiserror::Error;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable was set but could not be parsed.
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Token manager tuning.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Max concurrent token exchanges across all credential identities.
    pub max_concurrent_exchanges: usize,
    /// Tokens within this margin of expiry are treated as already expired.
    pub expiry_margin_secs: i64,
    /// Retry policy for the token endpoint.
    pub retry: RetryConfig,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_concurrent_exchanges: 1,
            expiry_margin_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry/backoff tuning shared by the token manager and the upstream client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempt ceiling (first try included).
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Cap on any single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Cross-shop merge tuning.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Extra page fetches allowed per shop while cursor filtering leaves its
    /// buffer empty.
    pub cursor_refill_limit: u32,
    /// Per-request timeout for upstream page fetches.
    pub fetch_timeout: Duration,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            cursor_refill_limit: 5,
            fetch_timeout: Duration::from_secs(20),
        }
    }
}

/// Counting layer tuning.
#[derive(Debug, Clone)]
pub struct CountConfig {
    /// Page cap for quick (bounded) scans.
    pub quick_page_limit: u32,
    /// Page size used by counting scans.
    pub quick_page_size: u32,
    /// Wall-clock budget for a quick scan of one shop.
    pub quick_budget: Duration,
    /// Wall-clock budget for an exact scan of one shop.
    pub exact_budget: Duration,
    /// Default cache TTL for count results.
    pub default_cache_ttl: Duration,
    /// Ceiling any requested TTL is clamped to.
    pub max_cache_ttl: Duration,
    /// Persisted exact aggregates older than this are recomputed.
    pub exact_reuse_max_age_secs: i64,
    /// Max age at which the out-of-band pending snapshot is still trusted.
    pub pending_snapshot_max_age_secs: i64,
    /// Page cap for the live pending-scan fallback.
    pub pending_scan_page_limit: u32,
    /// Vendor status value that marks an order as pending.
    pub pending_status: String,
    /// Local-data age that triggers a background reconciliation.
    pub staleness_threshold_secs: i64,
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            quick_page_limit: 3,
            quick_page_size: 100,
            quick_budget: Duration::from_secs(10),
            exact_budget: Duration::from_secs(120),
            default_cache_ttl: Duration::from_secs(300),
            max_cache_ttl: Duration::from_secs(3600),
            exact_reuse_max_age_secs: 900,
            pending_snapshot_max_age_secs: 600,
            pending_scan_page_limit: 3,
            pending_status: "PENDING".to_string(),
            staleness_threshold_secs: 1800,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Token manager tuning.
    pub token: TokenConfig,
    /// Merge engine tuning.
    pub merge: MergeConfig,
    /// Counting layer tuning.
    pub count: CountConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` if a variable is set but cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = optional_var("SHOPDECK_TOKEN_CONCURRENCY")? {
            config.token.max_concurrent_exchanges = n;
        }
        if let Some(n) = optional_var("SHOPDECK_TOKEN_EXPIRY_MARGIN_SECS")? {
            config.token.expiry_margin_secs = n;
        }
        if let Some(n) = optional_var("SHOPDECK_RETRY_MAX_ATTEMPTS")? {
            config.token.retry.max_attempts = n;
        }
        if let Some(n) = optional_var("SHOPDECK_MERGE_REFILL_LIMIT")? {
            config.merge.cursor_refill_limit = n;
        }
        if let Some(n) = optional_var::<u64>("SHOPDECK_FETCH_TIMEOUT_SECS")? {
            config.merge.fetch_timeout = Duration::from_secs(n);
        }
        if let Some(n) = optional_var("SHOPDECK_QUICK_PAGE_LIMIT")? {
            config.count.quick_page_limit = n;
        }
        if let Some(n) = optional_var("SHOPDECK_QUICK_PAGE_SIZE")? {
            config.count.quick_page_size = n;
        }
        if let Some(n) = optional_var::<u64>("SHOPDECK_QUICK_BUDGET_SECS")? {
            config.count.quick_budget = Duration::from_secs(n);
        }
        if let Some(n) = optional_var::<u64>("SHOPDECK_EXACT_BUDGET_SECS")? {
            config.count.exact_budget = Duration::from_secs(n);
        }
        if let Some(n) = optional_var::<u64>("SHOPDECK_COUNT_TTL_SECS")? {
            config.count.default_cache_ttl = Duration::from_secs(n);
        }
        if let Some(n) = optional_var::<u64>("SHOPDECK_COUNT_MAX_TTL_SECS")? {
            config.count.max_cache_ttl = Duration::from_secs(n);
        }
        if let Some(n) = optional_var("SHOPDECK_PENDING_SNAPSHOT_MAX_AGE_SECS")? {
            config.count.pending_snapshot_max_age_secs = n;
        }
        if let Some(n) = optional_var("SHOPDECK_PENDING_SCAN_PAGE_LIMIT")? {
            config.count.pending_scan_page_limit = n;
        }
        if let Some(n) = optional_var("SHOPDECK_STALENESS_THRESHOLD_SECS")? {
            config.count.staleness_threshold_secs = n;
        }

        Ok(config)
    }
}

/// Read and parse an optional environment variable.
fn optional_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar(name.to_string(), raw)),
        Err(_) => Ok(None),
    }
}
