//! Resource handlers: turn an accepted discovery response into installed state.
//!
//! A handler either applies a whole response or nothing. Decoding and
//! validation of every resource happen before the first write, so a single
//! malformed entry leaves the previous state untouched and the client NACKs.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use fail::fail_point;
use prost::Message;
use trustgate_authn::{AuthError, CacheRegistry, OrganizationIssuers, TrustIssuer, TrustStore};

use crate::{
    error::{Result, SyncError},
    proto::{JWT_ISSUER_TYPE_URL, JwtIssuer},
};

/// Applies the resources of one discovery type.
pub trait ResourceHandler: Send + Sync {
    /// Resource type URL this handler accepts.
    fn type_url(&self) -> &str;

    /// Install the complete resource set of `version`.
    ///
    /// Returns the number of resources installed.
    ///
    /// # Errors
    ///
    /// Any error means nothing was installed.
    fn apply(&self, version: &str, resources: &[prost_types::Any]) -> Result<usize>;
}

/// Installs JWT issuers into a [`TrustStore`].
///
/// Each response is the complete issuer set: organizations missing from it
/// are removed. Result caches of every organization whose issuers may have
/// changed are dropped, since their decisions were made against the old set.
pub struct JwtIssuerHandler {
    trust: Arc<TrustStore>,
    caches: Option<Arc<CacheRegistry>>,
}

impl JwtIssuerHandler {
    /// Handler installing into `trust`.
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust, caches: None }
    }

    /// Also invalidate result caches of affected organizations.
    #[must_use]
    pub fn with_cache_registry(mut self, caches: Arc<CacheRegistry>) -> Self {
        self.caches = Some(caches);
        self
    }

    /// Decode and resolve every issuer, grouped by organization.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidResource`] for a wrong type URL, undecodable bytes or a bad issuer
    /// - [`SyncError::Install`] for duplicate issuers within an organization
    pub fn decode(resources: &[prost_types::Any]) -> Result<Vec<OrganizationIssuers>> {
        let mut by_org: BTreeMap<String, Vec<TrustIssuer>> = BTreeMap::new();

        for (index, any) in resources.iter().enumerate() {
            if any.type_url != JWT_ISSUER_TYPE_URL {
                return Err(SyncError::invalid_resource(format!(
                    "resource {index} has type {}, expected {JWT_ISSUER_TYPE_URL}",
                    any.type_url
                )));
            }
            let raw = JwtIssuer::decode(any.value.as_slice())
                .map_err(|e| SyncError::invalid_resource(format!("resource {index}: {e}")))?;
            let org = raw.organization.clone();
            let iss = raw.issuer.clone();
            let issuer = TrustIssuer::from_config(raw.into()).map_err(|e| {
                SyncError::invalid_resource(format!("issuer {iss} of organization {org}: {e}"))
            })?;
            by_org.entry(org).or_default().push(issuer);
        }

        by_org
            .into_iter()
            .map(|(org, issuers)| OrganizationIssuers::new(org, issuers).map_err(SyncError::from))
            .collect()
    }
}

impl ResourceHandler for JwtIssuerHandler {
    fn type_url(&self) -> &str {
        JWT_ISSUER_TYPE_URL
    }

    fn apply(&self, version: &str, resources: &[prost_types::Any]) -> Result<usize> {
        let organizations = Self::decode(resources)?;

        fail_point!("issuer-before-install", |_| {
            Err(SyncError::Install(AuthError::InvalidConfig(
                "fail point: issuer-before-install".into(),
            )))
        });

        let mut affected: HashSet<String> = self.trust.organizations();
        affected.extend(organizations.iter().map(|org| org.organization().to_owned()));
        let installed = organizations.iter().map(OrganizationIssuers::len).sum();
        let organization_count = organizations.len();

        self.trust.replace_all(organizations);

        if let Some(caches) = &self.caches {
            for org in &affected {
                caches.invalidate_organization(org);
            }
        }

        tracing::info!(
            version,
            issuers = installed,
            organizations = organization_count,
            "Installed JWT issuers"
        );
        Ok(installed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use trustgate_authn::{
        config::ResultCacheConfig,
        testutil::{RSA_CERT_PEM, TEST_ISSUER},
    };

    use super::*;
    use crate::testutil::{jwks_issuer, pem_issuer};

    fn handler() -> (JwtIssuerHandler, Arc<TrustStore>) {
        let trust = Arc::new(TrustStore::new());
        (JwtIssuerHandler::new(Arc::clone(&trust)), trust)
    }

    #[test]
    fn test_groups_by_organization() {
        let (handler, trust) = handler();
        let resources = vec![
            jwks_issuer("acme", TEST_ISSUER).to_any(),
            jwks_issuer("acme", "https://other.example.com").to_any(),
            pem_issuer("globex", TEST_ISSUER, RSA_CERT_PEM).to_any(),
        ];

        assert_eq!(handler.apply("v1", &resources).unwrap(), 3);
        assert_eq!(trust.organization("acme").unwrap().len(), 2);
        assert!(trust.resolve("globex", TEST_ISSUER).unwrap().certificate().is_some());
    }

    #[test]
    fn test_state_of_the_world_replacement() {
        let (handler, trust) = handler();
        handler.apply("v1", &[jwks_issuer("acme", TEST_ISSUER).to_any()]).unwrap();
        handler.apply("v2", &[jwks_issuer("globex", TEST_ISSUER).to_any()]).unwrap();

        assert!(trust.organization("acme").is_none());
        assert!(trust.organization("globex").is_some());
    }

    #[test]
    fn test_one_bad_resource_rejects_the_batch() {
        let (handler, trust) = handler();
        handler.apply("v1", &[jwks_issuer("acme", TEST_ISSUER).to_any()]).unwrap();

        let batch = vec![
            jwks_issuer("globex", TEST_ISSUER).to_any(),
            pem_issuer("globex", "https://broken.example.com", "not a pem").to_any(),
        ];
        let err = handler.apply("v2", &batch).unwrap_err();

        assert!(matches!(err, SyncError::InvalidResource(_)), "{err:?}");
        assert!(trust.organization("acme").is_some(), "previous state kept");
        assert!(trust.organization("globex").is_none(), "nothing from the batch installed");
    }

    #[test]
    fn test_wrong_type_url_and_garbage() {
        let wrong_type =
            prost_types::Any { type_url: "type.googleapis.com/Other".into(), value: vec![] };
        assert!(matches!(
            JwtIssuerHandler::decode(&[wrong_type]),
            Err(SyncError::InvalidResource(_))
        ));

        let garbage = prost_types::Any {
            type_url: JWT_ISSUER_TYPE_URL.into(),
            value: vec![0xff, 0xff, 0xff],
        };
        assert!(matches!(JwtIssuerHandler::decode(&[garbage]), Err(SyncError::InvalidResource(_))));
    }

    #[test]
    fn test_duplicate_issuer_is_install_error() {
        let batch = vec![
            jwks_issuer("acme", TEST_ISSUER).to_any(),
            jwks_issuer("acme", TEST_ISSUER).to_any(),
        ];
        assert!(matches!(JwtIssuerHandler::decode(&batch), Err(SyncError::Install(_))));
    }

    #[tokio::test]
    async fn test_invalidates_affected_caches() {
        let trust = Arc::new(TrustStore::new());
        let caches = Arc::new(CacheRegistry::new(ResultCacheConfig::default()));
        let handler =
            JwtIssuerHandler::new(Arc::clone(&trust)).with_cache_registry(Arc::clone(&caches));

        handler.apply("v1", &[jwks_issuer("acme", TEST_ISSUER).to_any()]).unwrap();
        let before = caches.for_organization("acme");
        handler.apply("v2", &[]).unwrap();
        let after = caches.for_organization("acme");

        assert!(!Arc::ptr_eq(&before, &after));
    }
}
