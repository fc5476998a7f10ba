//! # Trustgate Authentication
//!
//! Bearer token validation for the trustgate API gateway enforcer.
//!
//! This crate provides:
//! - **Token validation**: signature, algorithm allow-list and expiry checks
//!   producing a structured [`ValidationResult`]
//! - **Key resolution**: remote key sets with refresh-on-unknown-kid, or a
//!   static issuer certificate
//! - **Result caching**: bounded, idle-expiring caches scoped per organization
//! - **Trust state**: the per-organization issuer map, replaced copy-on-write
//!   by the discovery client in `trustgate-trust-sync`
//!
//! ## Security
//!
//! - Only asymmetric algorithms (RSA, RSA-PSS, ECDSA P-256/P-384) are accepted
//! - `none` and HMAC algorithms are refused before any key lookup
//! - Token material is never logged; identifiers appear only as truncated hashes
//!
//! ## Example
//!
//! ```no_run
//! use trustgate_authn::{
//!     Authenticator, AuthConfig, OrganizationIssuers, TrustIssuer, TrustIssuerConfig,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = Authenticator::with_http(AuthConfig::default())?;
//!
//! let issuer = TrustIssuer::from_config(
//!     TrustIssuerConfig::builder()
//!         .organization("acme")
//!         .issuer("https://idp.example.com")
//!         .jwks_url("https://idp.example.com/.well-known/jwks.json")
//!         .build(),
//! )?;
//! auth.trust_store().install_organization(OrganizationIssuers::new("acme", vec![issuer])?);
//!
//! let result = auth.validate_bearer_token("eyJhbGciOi...", Some("acme")).await?;
//! println!("valid: {} ({})", result.is_valid, result.code.as_u32());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Request-path entry point.
pub mod authenticator;
/// Per-organization result cache registry.
pub mod cache_registry;
/// Issuer-specific claim handling.
pub mod claims;
/// Validation engine configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// Remote key-set fetching.
pub mod fetcher;
/// Trusted issuers and the trust store.
pub mod issuer;
/// Public keys and key sets.
pub mod key_set;
/// Remote key-set cache.
pub mod key_set_cache;
/// Signing key resolution.
pub mod key_source;
/// Validation metrics.
pub mod metrics;
/// Validation result caches.
pub mod result_cache;
/// Revoked token tracking.
pub mod revocation;
/// Bearer token parsing.
pub mod token;
/// Algorithm validation.
pub mod validation;
/// Token validation state machine.
pub mod validator;

/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export key types for convenience
pub use authenticator::Authenticator;
pub use cache_registry::{CacheRegistry, CredentialKind};
pub use config::AuthConfig;
pub use error::{AuthError, FetchError, Result};
pub use fetcher::{HttpKeySetFetcher, JwksEndpoint, KeySetFetcher};
pub use issuer::{
    DEFAULT_ORGANIZATION, OrganizationIssuers, TrustIssuer, TrustIssuerConfig, TrustStore,
};
pub use key_set::{KeySet, PublicKey};
pub use key_set_cache::KeySetCache;
pub use key_source::KeySource;
pub use metrics::{AuthMetrics, AuthMetricsSnapshot};
pub use result_cache::{ResultCache, TokenKey};
pub use revocation::{InMemoryRevocationList, RevocationList};
pub use token::SignedTokenHandle;
pub use validation::{DEFAULT_ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
pub use validator::{TokenValidator, ValidationCode, ValidationResult, ValidatorSettings};
