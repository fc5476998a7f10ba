//! Trusted issuers and the per-organization trust store.
//!
//! A [`TrustIssuer`] is resolved once from its [`TrustIssuerConfig`]:
//! certificates are parsed and claim transformers chosen at load time, so a
//! bad certificate is an installation failure rather than a per-request one.
//!
//! [`TrustStore`] holds `organization → issuers` behind an [`ArcSwap`].
//! Updates build a complete new map and swap the pointer; a reader holding a
//! snapshot sees either the whole old generation or the whole new one.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::{
    claims::{ClaimNames, ClaimTransformer, DEFAULT_CONSUMER_KEY_CLAIM, DEFAULT_SCOPES_CLAIM},
    error::{AuthError, Result},
    fetcher::JwksEndpoint,
    key_set::PublicKey,
};

/// Organization used when the caller supplies no hint.
pub const DEFAULT_ORGANIZATION: &str = "default";

/// Declarative description of a trusted issuer, as pushed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustIssuerConfig {
    /// Owning organization.
    #[builder(into)]
    pub organization: String,

    /// Expected `iss` claim value.
    #[builder(into)]
    pub issuer: String,

    /// Display name, reported as the key manager of validated tokens.
    #[serde(default)]
    #[builder(into, default)]
    pub name: String,

    /// Remote key-set URL.
    #[serde(default)]
    #[builder(into)]
    pub jwks_url: Option<String>,

    /// Extra CA certificate (PEM) trusted when fetching `jwks_url`.
    #[serde(default)]
    #[builder(into)]
    pub jwks_ca_certificate: Option<String>,

    /// Static signing certificate or public key (PEM).
    #[serde(default)]
    #[builder(into)]
    pub certificate: Option<String>,

    /// Claim holding the consumer key; defaults to `azp`.
    #[serde(default)]
    #[builder(into)]
    pub consumer_key_claim: Option<String>,

    /// Claim holding scopes; defaults to `scope`.
    #[serde(default)]
    #[builder(into)]
    pub scopes_claim: Option<String>,

    /// Remote claim name → local claim name.
    #[serde(default)]
    #[builder(default)]
    pub claim_mappings: HashMap<String, String>,
}

/// A trusted issuer with its key material resolved.
#[derive(Debug, Clone)]
pub struct TrustIssuer {
    organization: String,
    issuer: String,
    name: String,
    jwks: Option<JwksEndpoint>,
    certificate: Option<PublicKey>,
    claim_names: ClaimNames,
    transformer: ClaimTransformer,
}

impl TrustIssuer {
    /// Resolve a configuration.
    ///
    /// An issuer with neither a key-set URL nor a certificate is accepted;
    /// every token it signs will fail key resolution.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidConfig`] if organization or issuer is empty, or the URL is not HTTP(S)
    /// - [`AuthError::InvalidPublicKey`] / [`AuthError::UnsupportedKeyType`] for a bad certificate
    pub fn from_config(config: TrustIssuerConfig) -> Result<Self> {
        if config.organization.trim().is_empty() {
            return Err(AuthError::InvalidConfig("issuer organization is empty".into()));
        }
        if config.issuer.trim().is_empty() {
            return Err(AuthError::InvalidConfig("issuer URL is empty".into()));
        }

        let jwks = match config.jwks_url {
            Some(url) if !url.is_empty() => {
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    return Err(AuthError::InvalidConfig(format!(
                        "key set URL for {} must be http(s): {url}",
                        config.issuer
                    )));
                }
                let endpoint = JwksEndpoint::new(url);
                Some(match config.jwks_ca_certificate {
                    Some(ca) if !ca.is_empty() => endpoint.with_ca_certificate(ca),
                    _ => endpoint,
                })
            },
            _ => None,
        };

        let certificate = match config.certificate.as_deref() {
            Some(pem) if !pem.trim().is_empty() => Some(PublicKey::from_pem(pem)?),
            _ => None,
        };

        let claim_names = ClaimNames {
            scopes: non_empty_or(config.scopes_claim, DEFAULT_SCOPES_CLAIM),
            consumer_key: non_empty_or(config.consumer_key_claim, DEFAULT_CONSUMER_KEY_CLAIM),
        };

        Ok(Self {
            organization: config.organization,
            issuer: config.issuer,
            name: config.name,
            jwks,
            certificate,
            claim_names,
            transformer: ClaimTransformer::from_mappings(config.claim_mappings),
        })
    }

    /// Owning organization.
    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Expected `iss` value.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote key-set endpoint, if configured.
    pub fn jwks(&self) -> Option<&JwksEndpoint> {
        self.jwks.as_ref()
    }

    /// Static certificate key, if configured.
    pub fn certificate(&self) -> Option<&PublicKey> {
        self.certificate.as_ref()
    }

    /// Scope and consumer-key claim names.
    pub fn claim_names(&self) -> &ClaimNames {
        &self.claim_names
    }

    /// Claim transformer.
    pub fn transformer(&self) -> &ClaimTransformer {
        &self.transformer
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value.filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_owned())
}

/// The trusted issuers of one organization, indexed by `iss`.
#[derive(Debug)]
pub struct OrganizationIssuers {
    organization: String,
    issuers: HashMap<String, Arc<TrustIssuer>>,
}

impl OrganizationIssuers {
    /// Group issuers for `organization`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if an issuer belongs to another
    /// organization or two issuers share an `iss` value.
    pub fn new(organization: impl Into<String>, issuers: Vec<TrustIssuer>) -> Result<Self> {
        let organization = organization.into();
        let mut by_iss = HashMap::with_capacity(issuers.len());
        for issuer in issuers {
            if issuer.organization != organization {
                return Err(AuthError::InvalidConfig(format!(
                    "issuer {} belongs to {}, not {}",
                    issuer.issuer, issuer.organization, organization
                )));
            }
            let iss = issuer.issuer.clone();
            if by_iss.insert(iss.clone(), Arc::new(issuer)).is_some() {
                return Err(AuthError::InvalidConfig(format!(
                    "duplicate issuer {iss} in organization {organization}"
                )));
            }
        }
        Ok(Self { organization, issuers: by_iss })
    }

    /// Organization id.
    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Issuer trusted under `iss`.
    pub fn get(&self, iss: &str) -> Option<Arc<TrustIssuer>> {
        self.issuers.get(iss).cloned()
    }

    /// All issuers of the organization.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TrustIssuer>> {
        self.issuers.values()
    }

    /// Number of issuers.
    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    /// True when the organization trusts no issuer.
    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }
}

type IssuerMap = HashMap<String, Arc<OrganizationIssuers>>;

/// Process-wide trusted issuer state, replaced copy-on-write.
#[derive(Debug, Default)]
pub struct TrustStore {
    organizations: ArcSwap<IssuerMap>,
}

impl TrustStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current issuers of `organization`.
    pub fn organization(&self, organization: &str) -> Option<Arc<OrganizationIssuers>> {
        self.organizations.load().get(organization).cloned()
    }

    /// Issuer trusted for `iss` within `organization`.
    pub fn resolve(&self, organization: &str, iss: &str) -> Option<Arc<TrustIssuer>> {
        self.organizations.load().get(organization).and_then(|org| org.get(iss))
    }

    /// Consistent view of every organization.
    pub fn snapshot(&self) -> Arc<IssuerMap> {
        self.organizations.load_full()
    }

    /// Organization ids currently known.
    pub fn organizations(&self) -> HashSet<String> {
        self.organizations.load().keys().cloned().collect()
    }

    /// Replace one organization's issuers, leaving the others untouched.
    pub fn install_organization(&self, issuers: OrganizationIssuers) {
        let issuers = Arc::new(issuers);
        self.organizations.rcu(|current| {
            let mut next = IssuerMap::clone(current);
            next.insert(issuers.organization.clone(), Arc::clone(&issuers));
            next
        });
        tracing::debug!(
            organization = %issuers.organization,
            issuers = issuers.len(),
            "Installed organization issuers"
        );
    }

    /// Replace the whole store. Organizations absent from `organizations` are dropped.
    pub fn replace_all(&self, organizations: Vec<OrganizationIssuers>) {
        let next: IssuerMap = organizations
            .into_iter()
            .map(|org| (org.organization.clone(), Arc::new(org)))
            .collect();
        let count = next.len();
        self.organizations.store(Arc::new(next));
        tracing::debug!(organizations = count, "Replaced trust store");
    }

    /// Remove one organization.
    pub fn remove_organization(&self, organization: &str) {
        self.organizations.rcu(|current| {
            let mut next = IssuerMap::clone(current);
            next.remove(organization);
            next
        });
    }
}
