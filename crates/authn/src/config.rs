//! Validation engine configuration.
//!
//! Loading is the caller's business; these types only deserialize and
//! validate. Durations use humantime strings (`"5s"`, `"15m"`).
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use trustgate_authn::config::AuthConfig;
//!
//! let config = AuthConfig::builder()
//!     .clock_skew(Duration::from_secs(10))
//!     .require_expiry(true)
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AuthError, Result},
    fetcher::DEFAULT_FETCH_TIMEOUT,
    key_set_cache::DEFAULT_KEY_SET_CAPACITY,
    validation::{DEFAULT_ACCEPTED_ALGORITHMS, parse_algorithms},
};

/// Default clock-skew allowance applied to `exp`.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5);

/// Default maximum entries per result cache.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Default idle expiry per result cache, measured from last access.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Tokens longer than this are keyed in the result caches by their SHA-256.
pub const DEFAULT_TOKEN_HASH_THRESHOLD: usize = 4096;

/// Default number of revoked token identifiers tracked.
pub const DEFAULT_REVOCATION_CAPACITY: u64 = 100_000;

/// Size and idle-expiry bounds for one result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Maximum number of entries before least-recently-used eviction.
    #[serde(default = "default_max_entries")]
    #[builder(default = DEFAULT_MAX_ENTRIES)]
    pub max_entries: u64,

    /// Entries expire this long after their last read or write.
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    #[builder(default = DEFAULT_IDLE_TIMEOUT)]
    pub idle_timeout: Duration,
}

fn default_max_entries() -> u64 {
    DEFAULT_MAX_ENTRIES
}

fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { max_entries: DEFAULT_MAX_ENTRIES, idle_timeout: DEFAULT_IDLE_TIMEOUT }
    }
}

impl CacheSettings {
    fn validate(&self, name: &str) -> Result<()> {
        if self.max_entries == 0 {
            return Err(AuthError::InvalidConfig(format!("{name}.max_entries must be positive")));
        }
        if self.idle_timeout.is_zero() {
            return Err(AuthError::InvalidConfig(format!("{name}.idle_timeout must be positive")));
        }
        Ok(())
    }
}

/// Bounds for the three caches kept per credential kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CredentialCacheConfig {
    /// Parsed token handles.
    pub parsed: CacheSettings,
    /// Positive validation results.
    pub valid: CacheSettings,
    /// Negative validation results.
    pub invalid: CacheSettings,
}

/// Cache bounds for every credential kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResultCacheConfig {
    /// Bearer access tokens.
    pub access_token: CredentialCacheConfig,
    /// Gateway-internal keys.
    pub internal_key: CredentialCacheConfig,
    /// API keys.
    pub api_key: CredentialCacheConfig,
}

impl ResultCacheConfig {
    fn validate(&self) -> Result<()> {
        for (kind, c) in [
            ("access_token", &self.access_token),
            ("internal_key", &self.internal_key),
            ("api_key", &self.api_key),
        ] {
            c.parsed.validate(&format!("caches.{kind}.parsed"))?;
            c.valid.validate(&format!("caches.{kind}.valid"))?;
            c.invalid.validate(&format!("caches.{kind}.invalid"))?;
        }
        Ok(())
    }
}

/// Top-level configuration for the validation engine.
#[derive(Debug, Clone, PartialEq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Tolerance added to `exp` before comparing with the current time.
    #[serde(with = "humantime_serde", default = "default_clock_skew")]
    #[builder(default = DEFAULT_CLOCK_SKEW)]
    pub clock_skew: Duration,

    /// Reject tokens without `exp`. Off by default: such tokens never expire.
    #[serde(default)]
    #[builder(default)]
    pub require_expiry: bool,

    /// Accepted signature algorithm names. Symmetric algorithms and `none` are refused.
    #[serde(default = "default_algorithm_names")]
    #[builder(default = default_algorithm_names())]
    pub accepted_algorithms: Vec<String>,

    /// Result cache bounds.
    #[serde(default)]
    #[builder(default)]
    pub caches: ResultCacheConfig,

    /// Length above which tokens are keyed by hash in the result caches.
    #[serde(default = "default_token_hash_threshold")]
    #[builder(default = DEFAULT_TOKEN_HASH_THRESHOLD)]
    pub token_hash_threshold: usize,

    /// Timeout for one key-set fetch.
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    #[builder(default = DEFAULT_FETCH_TIMEOUT)]
    pub jwks_fetch_timeout: Duration,

    /// Maximum number of key-set endpoints cached.
    #[serde(default = "default_key_set_capacity")]
    #[builder(default = DEFAULT_KEY_SET_CAPACITY)]
    pub key_set_capacity: u64,

    /// Maximum number of revoked token identifiers tracked.
    #[serde(default = "default_revocation_capacity")]
    #[builder(default = DEFAULT_REVOCATION_CAPACITY)]
    pub revocation_capacity: u64,
}

fn default_clock_skew() -> Duration {
    DEFAULT_CLOCK_SKEW
}

fn default_algorithm_names() -> Vec<String> {
    DEFAULT_ACCEPTED_ALGORITHMS.iter().map(|alg| format!("{alg:?}")).collect()
}

fn default_token_hash_threshold() -> usize {
    DEFAULT_TOKEN_HASH_THRESHOLD
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_key_set_capacity() -> u64 {
    DEFAULT_KEY_SET_CAPACITY
}

fn default_revocation_capacity() -> u64 {
    DEFAULT_REVOCATION_CAPACITY
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl AuthConfig {
    /// Check bounds and the algorithm list.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.accepted_algorithms.is_empty() {
            return Err(AuthError::InvalidConfig("accepted_algorithms is empty".into()));
        }
        parse_algorithms(&self.accepted_algorithms)?;
        self.caches.validate()?;
        if self.token_hash_threshold == 0 {
            return Err(AuthError::InvalidConfig("token_hash_threshold must be positive".into()));
        }
        if self.jwks_fetch_timeout.is_zero() {
            return Err(AuthError::InvalidConfig("jwks_fetch_timeout must be positive".into()));
        }
        if self.key_set_capacity == 0 || self.revocation_capacity == 0 {
            return Err(AuthError::InvalidConfig("capacities must be positive".into()));
        }
        Ok(())
    }

    /// Accepted algorithms, parsed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] for unknown or forbidden names.
    pub fn algorithms(&self) -> Result<Vec<Algorithm>> {
        parse_algorithms(&self.accepted_algorithms)
    }
}
