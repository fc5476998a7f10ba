//! Concurrency stress tests for the trust store and result caches.
#![allow(clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinSet;
use trustgate_authn::{
    AuthConfig, Authenticator, OrganizationIssuers, TrustIssuer, TrustIssuerConfig, TrustStore,
    ValidationCode,
    testutil::{MockKeySetFetcher, RSA_PRIVATE_PEM, jwks_json, rsa_jwk, sign_rs256, standard_claims},
};

const ISSUERS_PER_GENERATION: usize = 8;

/// Issuers for `generation`, all tagged with the generation in name and URL.
fn generation(org: &str, generation: usize) -> OrganizationIssuers {
    let issuers = (0..ISSUERS_PER_GENERATION)
        .map(|i| {
            TrustIssuer::from_config(
                TrustIssuerConfig::builder()
                    .organization(org)
                    .issuer(format!("https://idp-{i}.example.com"))
                    .name(format!("gen-{generation}"))
                    .jwks_url(format!("https://idp-{i}.example.com/gen-{generation}/jwks"))
                    .build(),
            )
            .expect("issuer config")
        })
        .collect();
    OrganizationIssuers::new(org, issuers).expect("issuers")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_a_mixed_generation() {
    let store = Arc::new(TrustStore::new());
    store.install_organization(generation("acme", 0));
    let done = Arc::new(AtomicBool::new(false));

    let mut readers = JoinSet::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        readers.spawn(async move {
            let mut observations = 0u64;
            while !done.load(Ordering::Relaxed) {
                let org = store.organization("acme").expect("organization present");
                let names: Vec<&str> = org.iter().map(|issuer| issuer.name()).collect();
                assert_eq!(names.len(), ISSUERS_PER_GENERATION);
                assert!(
                    names.iter().all(|name| *name == names[0]),
                    "mixed generations observed: {names:?}"
                );
                observations += 1;
                tokio::task::yield_now().await;
            }
            observations
        });
    }

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for g in 1..=200 {
                store.install_organization(generation("acme", g));
                if g % 2 == 0 {
                    store.install_organization(generation("globex", g));
                }
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.expect("writer");
    done.store(true, Ordering::Relaxed);

    let mut total = 0;
    while let Some(joined) = readers.join_next().await {
        total += joined.expect("reader");
    }
    assert!(total > 0);
    let acme = store.organization("acme").expect("acme");
    assert_eq!(acme.iter().next().map(|i| i.name()), Some("gen-200"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_validation_of_one_token() {
    let fetcher = MockKeySetFetcher::new(jwks_json(&[rsa_jwk("kid-1")]))
        .with_delay(Duration::from_millis(50));
    let fetcher = Arc::new(fetcher);
    let auth = Arc::new(Authenticator::new(AuthConfig::default(), fetcher.clone()).expect("auth"));
    let issuer = TrustIssuer::from_config(
        TrustIssuerConfig::builder()
            .organization("acme")
            .issuer(trustgate_authn::testutil::TEST_ISSUER)
            .jwks_url(trustgate_authn::testutil::TEST_JWKS_URL)
            .build(),
    )
    .expect("issuer config");
    auth.trust_store()
        .install_organization(OrganizationIssuers::new("acme", vec![issuer]).expect("issuers"));

    let token = Arc::new(sign_rs256(RSA_PRIVATE_PEM, "kid-1", &standard_claims("alice", 3600)));
    let mut tasks = JoinSet::new();
    for _ in 0..64 {
        let auth = Arc::clone(&auth);
        let token = Arc::clone(&token);
        tasks.spawn(async move { auth.validate_bearer_token(&token, Some("acme")).await });
    }
    while let Some(joined) = tasks.join_next().await {
        let result = joined.expect("task").expect("parses");
        assert_eq!(result.code, ValidationCode::Success);
    }

    assert_eq!(fetcher.calls(), 1, "cold key-set misses are coalesced");
    assert_eq!(auth.metrics().snapshot().validations, 64);
}
