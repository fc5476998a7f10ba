//! Per-organization cache registry.
//!
//! Every organization gets its own set of result caches, so one tenant's
//! cached decision can never answer for another tenant even when the token
//! strings are identical. Caches are created lazily on first use.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    config::{CredentialCacheConfig, ResultCacheConfig},
    result_cache::ResultCache,
    token::SignedTokenHandle,
    validator::ValidationResult,
};

/// Kind of credential being validated. Each kind has its own caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Bearer access token from an external identity provider.
    AccessToken,
    /// Gateway-internal key.
    InternalKey,
    /// API key.
    ApiKey,
}

/// Parsed, valid and invalid caches for one credential kind.
pub struct CredentialCaches {
    /// Parsed token handles, saving a re-parse on repeat presentations.
    pub parsed: ResultCache<Arc<SignedTokenHandle>>,
    /// Positive results.
    pub valid: ResultCache<ValidationResult>,
    /// Negative results.
    pub invalid: ResultCache<ValidationResult>,
}

impl CredentialCaches {
    fn new(names: [&'static str; 3], config: &CredentialCacheConfig) -> Self {
        let [parsed, valid, invalid] = names;
        Self {
            parsed: ResultCache::new(parsed, config.parsed),
            valid: ResultCache::new(valid, config.valid),
            invalid: ResultCache::new(invalid, config.invalid),
        }
    }

    fn invalidate_all(&self) {
        self.parsed.invalidate_all();
        self.valid.invalidate_all();
        self.invalid.invalidate_all();
    }
}

/// All caches of one organization.
pub struct OrganizationCaches {
    access_tokens: CredentialCaches,
    internal_keys: CredentialCaches,
    api_keys: CredentialCaches,
}

impl OrganizationCaches {
    fn new(config: &ResultCacheConfig) -> Self {
        Self {
            access_tokens: CredentialCaches::new(
                ["parsed_token", "gateway_token", "invalid_token"],
                &config.access_token,
            ),
            internal_keys: CredentialCaches::new(
                ["parsed_internal_key", "internal_key", "invalid_internal_key"],
                &config.internal_key,
            ),
            api_keys: CredentialCaches::new(
                ["parsed_api_key", "api_key", "invalid_api_key"],
                &config.api_key,
            ),
        }
    }

    /// Caches for `kind`.
    pub fn for_kind(&self, kind: CredentialKind) -> &CredentialCaches {
        match kind {
            CredentialKind::AccessToken => &self.access_tokens,
            CredentialKind::InternalKey => &self.internal_keys,
            CredentialKind::ApiKey => &self.api_keys,
        }
    }
}

/// Registry of [`OrganizationCaches`] indexed by organization id.
pub struct CacheRegistry {
    config: ResultCacheConfig,
    organizations: DashMap<String, Arc<OrganizationCaches>>,
}

impl CacheRegistry {
    /// Empty registry; caches are built with `config` on first use.
    pub fn new(config: ResultCacheConfig) -> Self {
        Self { config, organizations: DashMap::new() }
    }

    /// Caches for `organization`, created on first use.
    pub fn for_organization(&self, organization: &str) -> Arc<OrganizationCaches> {
        if let Some(existing) = self.organizations.get(organization) {
            return Arc::clone(&existing);
        }
        let entry = self
            .organizations
            .entry(organization.to_owned())
            .or_insert_with(|| Arc::new(OrganizationCaches::new(&self.config)));
        Arc::clone(&entry)
    }

    /// Drop every cached result of `organization`.
    ///
    /// Called when the organization's trusted issuers change, since cached
    /// decisions were made against the old issuer set.
    pub fn invalidate_organization(&self, organization: &str) {
        if let Some((_, caches)) = self.organizations.remove(organization) {
            caches.access_tokens.invalidate_all();
            caches.internal_keys.invalidate_all();
            caches.api_keys.invalidate_all();
            tracing::debug!(organization, "Invalidated organization caches");
        }
    }

    /// Organizations with caches currently allocated.
    pub fn organization_count(&self) -> usize {
        self.organizations.len()
    }
}
