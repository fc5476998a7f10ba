//! Request-path entry point.
//!
//! [`Authenticator`] owns every piece the validation path needs and is built
//! once per process. The trust store and cache registry are shared by `Arc`
//! with the discovery client that keeps them current.
//!
//! # Flow
//!
//! ```text
//! validate_bearer_token(raw, org)
//!     organization known?  no                 → INVALID_CREDENTIALS, nothing allocated
//!     valid cache hit    → revoked?  demote to invalid
//!                        → expired?  demote to invalid as TOKEN_EXPIRED
//!                        → otherwise return it
//!     invalid cache hit  → return it
//!     parse (parsed cache)                    → Parse error, not cached
//!     revoked?                                → INVALID_CREDENTIALS, cached
//!     issuer trusted for org?  no             → INVALID_CREDENTIALS, not cached
//!     TokenValidator::validate_at             → valid / invalid cache
//!                                               (key set unreachable: not cached)
//! ```

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::Map;

use crate::{
    cache_registry::{CacheRegistry, CredentialCaches, CredentialKind},
    config::AuthConfig,
    error::{AuthError, Result},
    fetcher::{HttpKeySetFetcher, KeySetFetcher},
    issuer::{DEFAULT_ORGANIZATION, TrustStore},
    key_set_cache::KeySetCache,
    key_source::KeySource,
    metrics::AuthMetrics,
    result_cache::TokenKey,
    revocation::{InMemoryRevocationList, RevocationList},
    token::{SignedTokenHandle, fingerprint},
    validator::{TokenValidator, ValidationCode, ValidationResult, ValidatorSettings},
};

/// Top-level validation context.
pub struct Authenticator {
    config: AuthConfig,
    trust: Arc<TrustStore>,
    caches: Arc<CacheRegistry>,
    validator: TokenValidator,
    revoked: Arc<dyn RevocationList>,
    metrics: Arc<AuthMetrics>,
}

impl Authenticator {
    /// Build a context fetching remote key sets through `fetcher`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: AuthConfig, fetcher: Arc<dyn KeySetFetcher>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(AuthMetrics::new());
        let key_sets =
            Arc::new(KeySetCache::new(fetcher, config.key_set_capacity, Arc::clone(&metrics)));
        let settings = ValidatorSettings {
            clock_skew: config.clock_skew,
            require_expiry: config.require_expiry,
            accepted_algorithms: config.algorithms()?,
        };

        Ok(Self {
            trust: Arc::new(TrustStore::new()),
            caches: Arc::new(CacheRegistry::new(config.caches)),
            validator: TokenValidator::new(KeySource::new(key_sets), settings),
            revoked: Arc::new(InMemoryRevocationList::new(config.revocation_capacity)),
            metrics,
            config,
        })
    }

    /// Build a context fetching remote key sets over HTTPS.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if `config` fails validation or
    /// the HTTP client cannot be built.
    pub fn with_http(config: AuthConfig) -> Result<Self> {
        let fetcher = HttpKeySetFetcher::new(config.jwks_fetch_timeout)
            .map_err(|e| AuthError::InvalidConfig(format!("key set HTTP client: {e}")))?;
        Self::new(config, Arc::new(fetcher))
    }

    /// Replace the revocation list, e.g. with one shared across gateways.
    #[must_use]
    pub fn with_revocation_list(mut self, revoked: Arc<dyn RevocationList>) -> Self {
        self.revoked = revoked;
        self
    }

    /// Validate a bearer access token for `organization` (default organization when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Parse`] if the token is malformed. Rejections are
    /// reported as a negative [`ValidationResult`], not as errors.
    pub async fn validate_bearer_token(
        &self,
        raw: &str,
        organization: Option<&str>,
    ) -> Result<ValidationResult> {
        self.validate_credential(CredentialKind::AccessToken, raw, organization).await
    }

    /// Validate a signed credential of `kind`. Each kind has its own caches.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Parse`] if the credential is malformed.
    #[tracing::instrument(skip(self, raw), fields(org = tracing::field::Empty))]
    pub async fn validate_credential(
        &self,
        kind: CredentialKind,
        raw: &str,
        organization: Option<&str>,
    ) -> Result<ValidationResult> {
        let org = organization.filter(|o| !o.is_empty()).unwrap_or(DEFAULT_ORGANIZATION);
        tracing::Span::current().record("org", org);
        self.metrics.record_validation();

        if self.trust.organization(org).is_none() {
            let handle = self.parse(raw)?;
            tracing::debug!(iss = handle.issuer(), "Unknown organization");
            self.metrics.record_outcome(ValidationCode::InvalidCredentials);
            return Ok(ValidationResult::rejected(
                ValidationCode::InvalidCredentials,
                org,
                Some(&handle),
            ));
        }

        let org_caches = self.caches.for_organization(org);
        let caches = org_caches.for_kind(kind);
        let key = TokenKey::new(raw, self.config.token_hash_threshold);
        let now = Utc::now().timestamp();

        if let Some(hit) = caches.valid.get(&key).await {
            self.metrics.record_cache_hit();
            let result = self.recheck_valid(caches, key, hit, now).await;
            self.metrics.record_outcome(result.code);
            return Ok(result);
        }
        if let Some(hit) = caches.invalid.get(&key).await {
            self.metrics.record_cache_hit();
            self.metrics.record_outcome(hit.code);
            return Ok(hit);
        }
        self.metrics.record_cache_miss();

        let handle = match caches.parsed.get(&key).await {
            Some(handle) => handle,
            None => {
                let handle = Arc::new(self.parse(raw)?);
                caches.parsed.put(key.clone(), Arc::clone(&handle), None).await;
                handle
            },
        };

        if self.revoked.is_revoked(handle.token_identifier()).await {
            tracing::debug!(
                token = %fingerprint(handle.token_identifier()),
                "Revoked credential presented"
            );
            let result =
                ValidationResult::rejected(ValidationCode::InvalidCredentials, org, Some(&handle));
            caches.invalid.put(key, result.clone(), None).await;
            self.metrics.record_outcome(result.code);
            return Ok(result);
        }

        let Some(issuer) = handle.issuer().and_then(|iss| self.trust.resolve(org, iss)) else {
            tracing::debug!(iss = handle.issuer(), "Issuer not trusted for organization");
            self.metrics.record_outcome(ValidationCode::InvalidCredentials);
            return Ok(ValidationResult::rejected(
                ValidationCode::InvalidCredentials,
                org,
                Some(&handle),
            ));
        };

        let result = self.validator.validate_at(&handle, &issuer, now).await;
        if result.is_valid {
            caches.valid.put(key, result.clone(), None).await;
        } else if result.transient {
            tracing::debug!(iss = handle.issuer(), "Key set unavailable, rejection not cached");
        } else {
            caches.invalid.put(key, result.clone(), None).await;
        }
        self.metrics.record_outcome(result.code);
        Ok(result)
    }

    fn parse(&self, raw: &str) -> Result<SignedTokenHandle> {
        SignedTokenHandle::parse(raw).inspect_err(|e| {
            self.metrics.record_parse_error();
            tracing::debug!(error = %e, "Malformed credential");
        })
    }

    /// A cached positive result is re-checked against revocation and expiry
    /// before being served again.
    async fn recheck_valid(
        &self,
        caches: &CredentialCaches,
        key: TokenKey,
        hit: ValidationResult,
        now: i64,
    ) -> ValidationResult {
        let revoked = match hit.token_identifier.as_deref() {
            Some(id) => self.revoked.is_revoked(id).await,
            None => false,
        };
        let code = if revoked {
            ValidationCode::InvalidCredentials
        } else if hit.is_expired_at(now, self.config.clock_skew) {
            ValidationCode::TokenExpired
        } else {
            return hit;
        };

        tracing::debug!(?code, "Cached valid result no longer holds");
        caches.valid.invalidate(&key).await;
        let demoted = demote(hit, code);
        caches.invalid.put(key, demoted.clone(), None).await;
        demoted
    }

    /// Revoke the credential with `token_id` (its `jti`, or its signature) for `expires_in`.
    pub async fn revoke(&self, token_id: &str, expires_in: Duration) {
        self.revoked.revoke(token_id, expires_in).await;
    }

    /// Revoke a raw credential until it expires.
    ///
    /// A credential without `exp` is revoked for the idle lifetime of the
    /// access-token valid cache, the longest a cached positive result can live
    /// without being read.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Parse`] if the credential is malformed.
    pub async fn revoke_token(&self, raw: &str) -> Result<()> {
        let handle = SignedTokenHandle::parse(raw)?;
        let now = Utc::now().timestamp();
        let expires_in = match handle.expiry() {
            Some(exp) => {
                let skew = i64::try_from(self.config.clock_skew.as_secs()).unwrap_or(0);
                Duration::from_secs(exp.saturating_add(skew).saturating_sub(now).max(0) as u64)
            },
            None => self.config.caches.access_token.valid.idle_timeout,
        };
        self.revoke(handle.token_identifier(), expires_in).await;
        Ok(())
    }

    /// Process-wide trusted issuer state.
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Per-organization result caches.
    pub fn caches(&self) -> &Arc<CacheRegistry> {
        &self.caches
    }

    /// Validation counters.
    pub fn metrics(&self) -> &Arc<AuthMetrics> {
        &self.metrics
    }

    /// Validator used on cache misses.
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Configuration in effect.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

fn demote(hit: ValidationResult, code: ValidationCode) -> ValidationResult {
    ValidationResult {
        is_valid: false,
        code,
        claims: Map::new(),
        scopes: Vec::new(),
        consumer_key: None,
        key_manager: None,
        ..hit
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        assert_auth_error,
        error::FetchError,
        issuer::{OrganizationIssuers, TrustIssuer, TrustIssuerConfig},
        testutil::{
            MockKeySetFetcher, RSA_PRIVATE_PEM, TEST_ISSUER, TEST_JWKS_URL, jwks_json, rsa_jwk,
            sign_rs256, standard_claims,
        },
    };

    fn authenticator() -> (Authenticator, Arc<MockKeySetFetcher>) {
        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[rsa_jwk("kid-1")])));
        let auth = Authenticator::new(AuthConfig::default(), fetcher.clone()).unwrap();
        trust(&auth, "acme");
        (auth, fetcher)
    }

    fn trust(auth: &Authenticator, org: &str) {
        let issuer = TrustIssuer::from_config(
            TrustIssuerConfig::builder()
                .organization(org)
                .issuer(TEST_ISSUER)
                .jwks_url(TEST_JWKS_URL)
                .build(),
        )
        .unwrap();
        let issuers = OrganizationIssuers::new(org, vec![issuer]).unwrap();
        auth.trust_store().install_organization(issuers);
    }

    #[tokio::test]
    async fn test_valid_result_is_cached() {
        let (auth, fetcher) = authenticator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));

        let first = auth.validate_bearer_token(&token, Some("acme")).await.unwrap();
        let second = auth.validate_bearer_token(&token, Some("acme")).await.unwrap();

        assert!(first.is_valid);
        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
        let snapshot = auth.metrics().snapshot();
        assert_eq!(snapshot.result_cache_hits, 1);
        assert_eq!(snapshot.valid, 2);
    }

    #[tokio::test]
    async fn test_organization_scoping() {
        let (auth, _) = authenticator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));

        let elsewhere = auth.validate_bearer_token(&token, Some("globex")).await.unwrap();
        assert_eq!(elsewhere.code, ValidationCode::InvalidCredentials);

        let default = auth.validate_bearer_token(&token, None).await.unwrap();
        assert_eq!(default.organization, DEFAULT_ORGANIZATION);
        assert!(!default.is_valid);
    }

    #[tokio::test]
    async fn test_untrusted_issuer_not_cached_as_invalid() {
        let (auth, _) = authenticator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));

        let rejected = auth.validate_bearer_token(&token, Some("globex")).await.unwrap();
        assert!(!rejected.is_valid);

        trust(&auth, "globex");
        let accepted = auth.validate_bearer_token(&token, Some("globex")).await.unwrap();
        assert!(accepted.is_valid, "a later trust update must take effect");
    }

    #[tokio::test]
    async fn test_cached_valid_result_expires() {
        let (auth, _) = authenticator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));
        let key = TokenKey::new(&token, auth.config().token_hash_threshold);
        let caches = auth.caches().for_organization("acme");
        let caches = caches.for_kind(CredentialKind::AccessToken);

        let mut stale = auth.validate_bearer_token(&token, Some("acme")).await.unwrap();
        stale.expiry_time = Some(Utc::now().timestamp() - 60);
        caches.valid.put(key.clone(), stale, None).await;

        let result = auth.validate_bearer_token(&token, Some("acme")).await.unwrap();
        assert_eq!(result.code, ValidationCode::TokenExpired);
        assert!(result.claims.is_empty());
        assert!(caches.valid.get(&key).await.is_none());
        assert_eq!(caches.invalid.get(&key).await.unwrap().code, ValidationCode::TokenExpired);
    }

    #[tokio::test]
    async fn test_revocation() {
        let (auth, _) = authenticator();
        let mut claims = standard_claims("alice", 3600);
        claims["jti"] = json!("jti-42");
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &claims);

        assert!(auth.validate_bearer_token(&token, Some("acme")).await.unwrap().is_valid);

        auth.revoke_token(&token).await.unwrap();
        let result = auth.validate_bearer_token(&token, Some("acme")).await.unwrap();
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
        assert_eq!(result.token_identifier.as_deref(), Some("jti-42"));
    }

    #[tokio::test]
    async fn test_revoked_before_first_use() {
        let (auth, fetcher) = authenticator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));
        let handle = SignedTokenHandle::parse(&token).unwrap();
        auth.revoke(handle.token_identifier(), Duration::from_secs(60)).await;

        let result = auth.validate_bearer_token(&token, Some("acme")).await.unwrap();
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_parse_error_propagates() {
        let (auth, _) = authenticator();
        assert_auth_error!(auth.validate_bearer_token("garbage", Some("acme")).await, Parse);
        assert_eq!(auth.metrics().snapshot().parse_errors, 1);
    }

    #[tokio::test]
    async fn test_credential_kinds_use_separate_caches() {
        let (auth, _) = authenticator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));
        auth.validate_credential(CredentialKind::ApiKey, &token, Some("acme")).await.unwrap();

        let key = TokenKey::new(&token, auth.config().token_hash_threshold);
        let caches = auth.caches().for_organization("acme");
        assert!(caches.for_kind(CredentialKind::ApiKey).valid.get(&key).await.is_some());
        assert!(caches.for_kind(CredentialKind::AccessToken).valid.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_key_set_not_cached_as_invalid() {
        let fetcher = Arc::new(MockKeySetFetcher::scripted(vec![
            Err(FetchError::transient("connection refused")),
            Err(FetchError::transient("connection refused")),
            Ok(jwks_json(&[rsa_jwk("kid-1")])),
        ]));
        let auth = Authenticator::new(AuthConfig::default(), fetcher.clone()).unwrap();
        trust(&auth, "acme");
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));
        let key = TokenKey::new(&token, auth.config().token_hash_threshold);

        let rejected = auth.validate_bearer_token(&token, Some("acme")).await.unwrap();
        assert!(rejected.transient);
        let caches = auth.caches().for_organization("acme");
        assert!(caches.for_kind(CredentialKind::AccessToken).invalid.get(&key).await.is_none());

        let accepted = auth.validate_bearer_token(&token, Some("acme")).await.unwrap();
        assert!(accepted.is_valid);
    }

    #[tokio::test]
    async fn test_unknown_organization_allocates_no_caches() {
        let (auth, _) = authenticator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));

        let result = auth.validate_bearer_token(&token, Some("globex")).await.unwrap();
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
        assert_eq!(result.organization, "globex");
        assert_eq!(auth.caches().organization_count(), 0);
        assert_auth_error!(auth.validate_bearer_token("garbage", Some("globex")).await, Parse);

        auth.validate_bearer_token(&token, Some("acme")).await.unwrap();
        assert_eq!(auth.caches().organization_count(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[])));
        let config = AuthConfig::builder().token_hash_threshold(0).build();
        assert_auth_error!(Authenticator::new(config, fetcher).map(|_| ()), InvalidConfig);
    }
}
