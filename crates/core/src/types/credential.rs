//! Upstream credential bundle types.
//!
//! Each shop on the marketplace is a separate seller account with its own
//! OAuth-style refresh credential. The engine looks these up read-only; the
//! bundle is immutable for the duration of a sync cycle.

use secrecy::SecretString;

use super::id::ShopId;

/// Tag used in token-cache identities when a credential has no platform tag.
const DEFAULT_PLATFORM_TAG: &str = "source";

/// Credentials for one upstream seller account.
///
/// The refresh token is the long-lived secret exchanged for short-lived
/// bearer tokens; it never appears in logs or serialized output
/// (`SecretString` redacts it from `Debug`).
#[derive(Debug, Clone)]
pub struct ShopCredential {
    /// Logical shop identifier used throughout the dashboard.
    pub shop_id: ShopId,
    /// OAuth client ID registered with the vendor.
    pub client_id: String,
    /// Long-lived refresh token (HIGH PRIVILEGE).
    pub refresh_token: SecretString,
    /// Token exchange endpoint.
    pub token_url: String,
    /// Base URL for the vendor's collection endpoints.
    pub api_base: String,
    /// Optional tag distinguishing vendor platforms sharing a client ID space.
    pub platform_tag: Option<String>,
}

impl ShopCredential {
    /// Stable identity for token caching and refresh de-duplication.
    ///
    /// Two credentials with the same identity share one cached token and
    /// at most one in-flight exchange.
    #[must_use]
    pub fn identity(&self) -> String {
        let tag = self.platform_tag.as_deref().unwrap_or(DEFAULT_PLATFORM_TAG);
        format!("{tag}:{}", self.client_id)
    }

    /// Whether the bundle has every field required for a token exchange.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        use secrecy::ExposeSecret;
        !self.client_id.is_empty()
            && !self.refresh_token.expose_secret().is_empty()
            && !self.token_url.is_empty()
            && !self.api_base.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(platform_tag: Option<&str>) -> ShopCredential {
        ShopCredential {
            shop_id: ShopId::new("s1"),
            client_id: "client-abc".to_string(),
            refresh_token: SecretString::from("refresh-secret"),
            token_url: "https://vendor.example/oauth/token".to_string(),
            api_base: "https://vendor.example/api".to_string(),
            platform_tag: platform_tag.map(String::from),
        }
    }

    #[test]
    fn test_identity_uses_platform_tag() {
        assert_eq!(credential(Some("mall")).identity(), "mall:client-abc");
        assert_eq!(credential(None).identity(), "source:client-abc");
    }

    #[test]
    fn test_is_complete() {
        assert!(credential(None).is_complete());

        let mut missing = credential(None);
        missing.refresh_token = SecretString::from("");
        assert!(!missing.is_complete());

        let mut missing = credential(None);
        missing.token_url = String::new();
        assert!(!missing.is_complete());
    }

    #[test]
    fn test_debug_redacts_refresh_token() {
        let debug = format!("{:?}", credential(None));
        assert!(!debug.contains("refresh-secret"));
    }
}
