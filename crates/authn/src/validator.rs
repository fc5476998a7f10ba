//! Token validation state machine.
//!
//! # Check order
//!
//! ```text
//! algorithm on allow-list?   no  → INVALID_CREDENTIALS
//! resolve signing key        err → INVALID_CREDENTIALS
//! verify signature           err → INVALID_CREDENTIALS
//! exp + skew > now?          no  → TOKEN_EXPIRED
//! populate result from transformed claims
//! ```
//!
//! The algorithm is checked before key resolution so that a token declaring
//! `none` or `HS256` never triggers a key-set fetch. The outcome is the same
//! as checking it during verification.
//!
//! The validator is pure given its inputs: it neither reads nor writes any
//! result cache. Malformed tokens fail earlier, in
//! [`SignedTokenHandle::parse`], and are reported as errors rather than as
//! negative results.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::Algorithm;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    error::{AuthError, Result},
    issuer::TrustIssuer,
    key_source::KeySource,
    token::SignedTokenHandle,
    validation::validate_algorithm,
};

/// Outcome code of a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    /// Token accepted.
    Success,
    /// Bad signature, unknown key, untrusted issuer, forbidden algorithm or revoked token.
    InvalidCredentials,
    /// Token past its `exp` plus the clock-skew allowance.
    TokenExpired,
}

impl ValidationCode {
    /// Numeric code reported to the gateway.
    pub const fn as_u32(self) -> u32 {
        match self {
            ValidationCode::Success => 0,
            ValidationCode::InvalidCredentials => 900_901,
            ValidationCode::TokenExpired => 900_903,
        }
    }
}

/// Structured outcome of a validation.
///
/// Cached entries are replaced whole and copied out on read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    /// Whether the token was accepted.
    pub is_valid: bool,
    /// Outcome code.
    pub code: ValidationCode,
    /// Claims after issuer-specific remapping. Empty for rejected tokens.
    pub claims: Map<String, Value>,
    /// `exp` in epoch seconds, when present.
    pub expiry_time: Option<i64>,
    /// `sub` claim.
    pub subject: Option<String>,
    /// `iss` claim.
    pub issuer: Option<String>,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Consumer key or client id.
    pub consumer_key: Option<String>,
    /// Name of the trusted issuer that vouched for the token.
    pub key_manager: Option<String>,
    /// `jti`, or the signature when absent.
    pub token_identifier: Option<String>,
    /// Organization the token was validated for.
    pub organization: String,
    /// Rejected only because key material could not be fetched. Such a
    /// result must not be cached: the same token may validate once the
    /// key-set endpoint is reachable again.
    #[serde(skip)]
    pub transient: bool,
}

impl ValidationResult {
    /// Negative result with `code`, carrying whatever identity the token
    /// header and claims expose.
    pub fn rejected(
        code: ValidationCode,
        organization: &str,
        token: Option<&SignedTokenHandle>,
    ) -> Self {
        Self {
            is_valid: false,
            code,
            claims: Map::new(),
            expiry_time: token.and_then(SignedTokenHandle::expiry),
            subject: token.and_then(|t| t.subject().map(str::to_owned)),
            issuer: token.and_then(|t| t.issuer().map(str::to_owned)),
            scopes: Vec::new(),
            consumer_key: None,
            key_manager: None,
            token_identifier: token.map(|t| t.token_identifier().to_owned()),
            organization: organization.to_owned(),
            transient: false,
        }
    }

    /// Whether `expiry_time + skew` is at or before `now` (epoch seconds).
    pub fn is_expired_at(&self, now: i64, skew: Duration) -> bool {
        self.expiry_time.is_some_and(|exp| !expiry_holds(exp, now, skew))
    }

    /// Time left until the token expires, if it expires.
    pub fn remaining_lifetime(&self, now: i64) -> Option<Duration> {
        self.expiry_time.map(|exp| Duration::from_secs(exp.saturating_sub(now).max(0) as u64))
    }
}

/// `exp + skew > now`.
fn expiry_holds(exp: i64, now: i64, skew: Duration) -> bool {
    let skew = i64::try_from(skew.as_secs()).unwrap_or(i64::MAX);
    exp.saturating_add(skew) > now
}

/// Policy knobs for [`TokenValidator`].
#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    /// Tolerance added to `exp`.
    pub clock_skew: Duration,
    /// Reject tokens without `exp`.
    pub require_expiry: bool,
    /// Signature algorithms honoured.
    pub accepted_algorithms: Vec<Algorithm>,
}

/// Verifies signature and expiry of a parsed token against a trusted issuer.
#[derive(Clone)]
pub struct TokenValidator {
    key_source: KeySource,
    settings: ValidatorSettings,
}

impl TokenValidator {
    /// Validator resolving keys through `key_source`.
    pub fn new(key_source: KeySource, settings: ValidatorSettings) -> Self {
        Self { key_source, settings }
    }

    /// Policy in effect.
    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    /// Parse and validate a raw token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Parse`] if the token is malformed. Every other
    /// failure is folded into a negative [`ValidationResult`].
    pub async fn validate_token(
        &self,
        raw: &str,
        issuer: &TrustIssuer,
    ) -> Result<ValidationResult> {
        let handle = SignedTokenHandle::parse(raw)?;
        Ok(self.validate(&handle, issuer).await)
    }

    /// Validate `token` as issued by `issuer`, at the current time.
    pub async fn validate(
        &self,
        token: &SignedTokenHandle,
        issuer: &TrustIssuer,
    ) -> ValidationResult {
        self.validate_at(token, issuer, Utc::now().timestamp()).await
    }

    /// Validate `token` as issued by `issuer`, as if the time were `now` (epoch seconds).
    pub async fn validate_at(
        &self,
        token: &SignedTokenHandle,
        issuer: &TrustIssuer,
        now: i64,
    ) -> ValidationResult {
        match self.check(token, issuer, now).await {
            Ok(()) => self.accepted(token, issuer),
            Err(e) => {
                tracing::debug!(
                    org = issuer.organization(),
                    iss = issuer.issuer(),
                    kid = token.key_id(),
                    error = %e,
                    "Token rejected"
                );
                let mut result = ValidationResult::rejected(
                    e.validation_code(),
                    issuer.organization(),
                    Some(token),
                );
                result.transient = e.is_transient();
                result
            },
        }
    }

    async fn check(&self, token: &SignedTokenHandle, issuer: &TrustIssuer, now: i64) -> Result<()> {
        let alg = validate_algorithm(token.algorithm(), &self.settings.accepted_algorithms)?;

        let key = self.key_source.resolve_key(token.key_id(), issuer).await?;
        key.verify(alg, token)?;

        match token.expiry() {
            Some(exp) if !expiry_holds(exp, now, self.settings.clock_skew) => {
                Err(AuthError::TokenExpired)
            },
            None if self.settings.require_expiry => {
                Err(AuthError::invalid_credential("token has no exp claim"))
            },
            _ => Ok(()),
        }
    }

    fn accepted(&self, token: &SignedTokenHandle, issuer: &TrustIssuer) -> ValidationResult {
        let claims = issuer.transformer().transform(token.claims());
        let names = issuer.claim_names();
        let key_manager = if issuer.name().is_empty() { issuer.issuer() } else { issuer.name() };

        ValidationResult {
            is_valid: true,
            code: ValidationCode::Success,
            expiry_time: token.expiry(),
            subject: claims.get("sub").and_then(Value::as_str).map(str::to_owned),
            issuer: token.issuer().map(str::to_owned),
            scopes: names.scopes(&claims),
            consumer_key: names.consumer_key(&claims),
            key_manager: Some(key_manager.to_owned()),
            token_identifier: Some(token.token_identifier().to_owned()),
            organization: issuer.organization().to_owned(),
            transient: false,
            claims,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        assert_auth_error,
        error::FetchError,
        issuer::TrustIssuerConfig,
        key_set_cache::KeySetCache,
        metrics::AuthMetrics,
        testutil::{
            MockKeySetFetcher, RSA_CERT_PEM, RSA_PRIVATE_PEM, RSA2_PRIVATE_PEM, TEST_ISSUER,
            TEST_JWKS_URL, craft_raw_jwt, ec_jwk, jwks_json, rsa_jwk, sign_es256, sign_rs256,
            standard_claims,
        },
        validation::DEFAULT_ACCEPTED_ALGORITHMS,
    };

    fn settings(require_expiry: bool) -> ValidatorSettings {
        ValidatorSettings {
            clock_skew: Duration::from_secs(5),
            require_expiry,
            accepted_algorithms: DEFAULT_ACCEPTED_ALGORITHMS.to_vec(),
        }
    }

    fn validator_with(
        fetcher: Arc<MockKeySetFetcher>,
        settings: ValidatorSettings,
    ) -> TokenValidator {
        let cache = KeySetCache::new(fetcher, 10, Arc::new(AuthMetrics::new()));
        TokenValidator::new(KeySource::new(Arc::new(cache)), settings)
    }

    fn validator() -> (TokenValidator, Arc<MockKeySetFetcher>) {
        let fetcher =
            Arc::new(MockKeySetFetcher::new(jwks_json(&[rsa_jwk("kid-1"), ec_jwk("kid-ec")])));
        (validator_with(fetcher.clone(), settings(false)), fetcher)
    }

    fn issuer() -> TrustIssuer {
        TrustIssuer::from_config(
            TrustIssuerConfig::builder()
                .organization("acme")
                .issuer(TEST_ISSUER)
                .name("Acme IdP")
                .jwks_url(TEST_JWKS_URL)
                .build(),
        )
        .unwrap()
    }

    fn parse(token: &str) -> SignedTokenHandle {
        SignedTokenHandle::parse(token).unwrap()
    }

    #[tokio::test]
    async fn test_valid_rs256_token() {
        let (validator, _) = validator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));

        let result = validator.validate_token(&token, &issuer()).await.unwrap();

        assert!(result.is_valid);
        assert_eq!(result.code, ValidationCode::Success);
        assert_eq!(result.subject.as_deref(), Some("alice"));
        assert_eq!(result.scopes, vec!["read", "write"]);
        assert_eq!(result.consumer_key.as_deref(), Some("app-1"));
        assert_eq!(result.key_manager.as_deref(), Some("Acme IdP"));
        assert_eq!(result.organization, "acme");
        assert_eq!(result.claims.get("sub"), Some(&json!("alice")));
    }

    #[tokio::test]
    async fn test_valid_es256_token() {
        let (validator, _) = validator();
        let token = sign_es256("kid-ec", &standard_claims("bob", 3600));

        let result = validator.validate(&parse(&token), &issuer()).await;
        assert!(result.is_valid, "{result:?}");
    }

    #[tokio::test]
    async fn test_wrong_key_is_invalid_credentials() {
        let (validator, _) = validator();
        let token = sign_rs256(RSA2_PRIVATE_PEM, "kid-1", &standard_claims("mallory", 3600));

        let result = validator.validate(&parse(&token), &issuer()).await;
        assert!(!result.is_valid);
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
        assert!(result.claims.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kid_is_invalid_credentials() {
        let (validator, fetcher) = validator();
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-404", &standard_claims("alice", 3600));

        let result = validator.validate(&parse(&token), &issuer()).await;
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
        assert_eq!(fetcher.calls(), 2);
        assert!(!result.transient);
    }

    #[rstest]
    #[case::unreachable(FetchError::transient("connection refused"), true)]
    #[case::not_found(FetchError::permanent("HTTP 404"), false)]
    #[tokio::test]
    async fn test_fetch_failure_marks_transient(
        #[case] error: FetchError,
        #[case] transient: bool,
    ) {
        let fetcher = Arc::new(MockKeySetFetcher::scripted(vec![Err(error)]));
        let validator = validator_with(fetcher, settings(false));
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));

        let result = validator.validate(&parse(&token), &issuer()).await;
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
        assert_eq!(result.transient, transient);
    }

    #[rstest]
    #[case::none("none")]
    #[case::hs256("HS256")]
    #[case::unknown("XX999")]
    #[tokio::test]
    async fn test_rejected_algorithm_never_fetches(#[case] alg: &str) {
        let (validator, fetcher) = validator();
        let token = craft_raw_jwt(
            &json!({"alg": alg, "kid": "kid-1"}),
            &standard_claims("mallory", 3600),
        );

        let result = validator.validate(&parse(&token), &issuer()).await;
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_algorithm_outside_allow_list() {
        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[rsa_jwk("kid-1")])));
        let narrow = ValidatorSettings {
            accepted_algorithms: vec![Algorithm::ES256],
            ..settings(false)
        };
        let validator = validator_with(fetcher, narrow);
        let token = sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600));

        let result = validator.validate(&parse(&token), &issuer()).await;
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let (validator, _) = validator();
        let exp = 1_700_000_000;
        let mut claims = standard_claims("alice", 0);
        claims["exp"] = json!(exp);
        let handle = parse(&sign_rs256(RSA_PRIVATE_PEM, "kid-1", &claims));

        // exp = now - skew + 1
        let result = validator.validate_at(&handle, &issuer(), exp + 5 - 1).await;
        assert!(result.is_valid);

        // exp = now - skew
        let result = validator.validate_at(&handle, &issuer(), exp + 5).await;
        assert_eq!(result.code, ValidationCode::TokenExpired);

        // exp = now - skew - 1
        let result = validator.validate_at(&handle, &issuer(), exp + 5 + 1).await;
        assert_eq!(result.code, ValidationCode::TokenExpired);
        assert_eq!(result.expiry_time, Some(exp));
    }

    #[tokio::test]
    async fn test_missing_exp_policy() {
        let mut claims = standard_claims("alice", 0);
        claims.as_object_mut().unwrap().remove("exp");
        let handle = parse(&sign_rs256(RSA_PRIVATE_PEM, "kid-1", &claims));

        let (lenient, _) = validator();
        assert!(lenient.validate(&handle, &issuer()).await.is_valid);

        let fetcher = Arc::new(MockKeySetFetcher::new(jwks_json(&[rsa_jwk("kid-1")])));
        let strict = validator_with(fetcher, settings(true));
        let result = strict.validate(&handle, &issuer()).await;
        assert_eq!(result.code, ValidationCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_claim_mapping_and_overrides() {
        let (validator, _) = validator();
        let config = TrustIssuerConfig::builder()
            .organization("acme")
            .issuer(TEST_ISSUER)
            .certificate(RSA_CERT_PEM)
            .scopes_claim("scp")
            .consumer_key_claim("cid")
            .claim_mappings(HashMap::from([("uid".to_owned(), "sub".to_owned())]))
            .build();
        let mapped = TrustIssuer::from_config(config).unwrap();

        let now = Utc::now().timestamp();
        let claims = json!({
            "iss": TEST_ISSUER,
            "sub": "service-account",
            "uid": "carol",
            "exp": now + 600,
            "scp": ["orders:read", "orders:write"],
            "cid": "mobile",
        });
        let token = sign_rs256(RSA_PRIVATE_PEM, "ignored", &claims);

        let result = validator.validate(&parse(&token), &mapped).await;
        assert!(result.is_valid, "{result:?}");
        assert_eq!(result.subject.as_deref(), Some("carol"));
        assert!(!result.claims.contains_key("uid"));
        assert_eq!(result.scopes, vec!["orders:read", "orders:write"]);
        assert_eq!(result.consumer_key.as_deref(), Some("mobile"));
        assert_eq!(result.key_manager.as_deref(), Some(TEST_ISSUER), "unnamed issuer");
    }

    #[tokio::test]
    async fn test_parse_error_is_not_a_result() {
        let (validator, _) = validator();
        assert_auth_error!(validator.validate_token("not-a-token", &issuer()).await, Parse);
    }

    #[test]
    fn test_codes() {
        assert_eq!(ValidationCode::Success.as_u32(), 0);
        assert_eq!(ValidationCode::InvalidCredentials.as_u32(), 900_901);
        assert_eq!(ValidationCode::TokenExpired.as_u32(), 900_903);
        assert_eq!(serde_json::to_value(ValidationCode::TokenExpired).unwrap(), "TOKEN_EXPIRED");
    }

    #[test]
    fn test_result_expiry_helpers() {
        let mut result = ValidationResult::rejected(ValidationCode::Success, "acme", None);
        assert!(!result.is_expired_at(i64::MAX, Duration::from_secs(5)), "no exp never expires");

        result.expiry_time = Some(100);
        assert!(!result.is_expired_at(104, Duration::from_secs(5)));
        assert!(result.is_expired_at(105, Duration::from_secs(5)));
        assert_eq!(result.remaining_lifetime(40), Some(Duration::from_secs(60)));
        assert_eq!(result.remaining_lifetime(200), Some(Duration::ZERO));
    }
}
