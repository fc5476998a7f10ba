//! Signing key resolution for a trusted issuer.
//!
//! ```text
//! resolve_key(kid, issuer)
//!     → issuer has a key-set URL?
//!         get_key_set → transient failure?  refresh once, bypassing the cache
//!         lookup(kid) → not found?           refresh once, look up again
//!     → issuer has a certificate?            use it
//!     → otherwise                            KeyNotFound
//! ```
//!
//! A remote key set takes precedence over a static certificate: an issuer
//! that configures both is expected to rotate through the key set.

use std::sync::Arc;

use crate::{
    error::{AuthError, Result},
    fetcher::JwksEndpoint,
    issuer::TrustIssuer,
    key_set::{KeySet, PublicKey},
    key_set_cache::KeySetCache,
};

/// Resolves public keys from an issuer's key set or certificate.
#[derive(Clone)]
pub struct KeySource {
    key_sets: Arc<KeySetCache>,
}

impl KeySource {
    /// Key source backed by `key_sets` for remote lookups.
    pub fn new(key_sets: Arc<KeySetCache>) -> Self {
        Self { key_sets }
    }

    /// The underlying key-set cache.
    pub fn key_sets(&self) -> &Arc<KeySetCache> {
        &self.key_sets
    }

    /// Public key for `kid` as trusted by `issuer`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::KeyNotFound`] if no key matches, including a missing `kid` for a
    ///   key-set issuer
    /// - [`AuthError::UnsupportedKeyType`] if the key set lists `kid` with an unsupported `kty`
    /// - [`AuthError::KeySetFetch`] if the key set cannot be fetched, even after one retry
    #[tracing::instrument(skip(self, issuer), fields(iss = %issuer.issuer()))]
    pub async fn resolve_key(&self, kid: Option<&str>, issuer: &TrustIssuer) -> Result<PublicKey> {
        if let Some(endpoint) = issuer.jwks() {
            let kid = kid.ok_or_else(|| AuthError::key_not_found("<missing kid>"))?;
            return self.resolve_remote(kid, endpoint).await;
        }

        if let Some(certificate) = issuer.certificate() {
            return Ok(certificate.clone());
        }

        tracing::debug!(kid, "Issuer has neither a key set nor a certificate");
        Err(AuthError::key_not_found(kid.unwrap_or("<missing kid>")))
    }

    async fn resolve_remote(&self, kid: &str, endpoint: &JwksEndpoint) -> Result<PublicKey> {
        let set = self.current_set(endpoint).await?;

        match set.lookup(kid) {
            Err(AuthError::KeyNotFound { .. }) => {
                tracing::debug!(
                    kid,
                    generation = set.generation(),
                    "Key id not in cached key set, refreshing"
                );
                let refreshed = self.key_sets.refresh(endpoint, Some(set.generation())).await?;
                refreshed.lookup(kid)
            },
            other => other,
        }
    }

    async fn current_set(&self, endpoint: &JwksEndpoint) -> Result<Arc<KeySet>> {
        match self.key_sets.get_key_set(endpoint).await {
            Err(e) if e.is_transient() => {
                tracing::debug!(error = %e, "Transient key set failure, retrying once");
                self.key_sets.refresh(endpoint, None).await
            },
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{
        assert_auth_error,
        error::FetchError,
        issuer::TrustIssuerConfig,
        key_set::KeyFamily,
        metrics::AuthMetrics,
        testutil::{
            EC_P256_CERT_PEM, MockKeySetFetcher, TEST_ISSUER, TEST_JWKS_URL, ec_jwk, jwks_json,
            rsa_jwk,
        },
    };

    fn source(fetcher: &Arc<MockKeySetFetcher>) -> KeySource {
        let cache = KeySetCache::new(fetcher.clone(), 10, Arc::new(AuthMetrics::new()));
        KeySource::new(Arc::new(cache))
    }

    fn remote_issuer() -> TrustIssuer {
        TrustIssuer::from_config(
            TrustIssuerConfig::builder()
                .organization("acme")
                .issuer(TEST_ISSUER)
                .jwks_url(TEST_JWKS_URL)
                .build(),
        )
        .unwrap()
    }

    fn certificate_issuer() -> TrustIssuer {
        TrustIssuer::from_config(
            TrustIssuerConfig::builder()
                .organization("acme")
                .issuer(TEST_ISSUER)
                .certificate(EC_P256_CERT_PEM)
                .build(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolves_from_cached_key_set() {
        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[rsa_jwk("kid-1")])));
        let source = source(&fetcher);

        for _ in 0..3 {
            let key = source.resolve_key(Some("kid-1"), &remote_issuer()).await.unwrap();
            assert_eq!(key.family(), KeyFamily::Rsa);
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_forces_one_refresh() {
        let fetcher = Arc::new(MockKeySetFetcher::scripted(vec![
            Ok(jwks_json(&[rsa_jwk("kid-0")])),
            Ok(jwks_json(&[rsa_jwk("kid-0"), rsa_jwk("kid-1")])),
        ]));
        let source = source(&fetcher);

        source.resolve_key(Some("kid-1"), &remote_issuer()).await.unwrap();
        assert_eq!(fetcher.calls(), 2, "initial miss plus one forced refresh");

        source.resolve_key(Some("kid-1"), &remote_issuer()).await.unwrap();
        assert_eq!(fetcher.calls(), 2, "refreshed set is cached");
    }

    #[tokio::test]
    async fn test_kid_missing_after_refresh_is_key_not_found() {
        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[rsa_jwk("kid-0")])));
        let source = source(&fetcher);

        let result = source.resolve_key(Some("kid-9"), &remote_issuer()).await;
        assert_auth_error!(result, KeyNotFound);
        assert_eq!(fetcher.calls(), 2, "exactly one retry");
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let fetcher = Arc::new(MockKeySetFetcher::scripted(vec![
            Err(FetchError::transient("connection reset")),
            Ok(jwks_json(&[rsa_jwk("kid-1")])),
        ]));
        let source = source(&fetcher);

        source.resolve_key(Some("kid-1"), &remote_issuer()).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let fetcher = Arc::new(MockKeySetFetcher::new("not json"));
        let source = source(&fetcher);

        let result = source.resolve_key(Some("kid-1"), &remote_issuer()).await;
        assert_auth_error!(result, KeySetFetch);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_kid_with_key_set() {
        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[rsa_jwk("kid-1")])));
        let result = source(&fetcher).resolve_key(None, &remote_issuer()).await;
        assert_auth_error!(result, KeyNotFound);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_certificate() {
        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[ec_jwk("kid-1")])));
        let source = source(&fetcher);

        let key = source.resolve_key(None, &certificate_issuer()).await.unwrap();
        assert_eq!(key.family(), KeyFamily::Ec(crate::key_set::EcCurve::P256));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_issuer_without_material() {
        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[])));
        let bare = TrustIssuer::from_config(
            TrustIssuerConfig::builder().organization("acme").issuer(TEST_ISSUER).build(),
        )
        .unwrap();

        let result = source(&fetcher).resolve_key(Some("kid-1"), &bare).await;
        assert_auth_error!(result, KeyNotFound);
    }
}
