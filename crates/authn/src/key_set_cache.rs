//! Remote key-set cache.
//!
//! # Architecture
//!
//! ```text
//! get_key_set(endpoint)
//!     → cached?  return it
//!     → miss     one fetch per endpoint, concurrent callers wait on it
//!
//! refresh(endpoint, seen_generation)
//!     → per-endpoint serialized compute
//!     → cached set newer than seen_generation?  another caller already refreshed, reuse it
//!     → otherwise fetch and replace wholesale
//! ```
//!
//! There is no time-based expiry: a set is replaced only when a caller asks
//! for a key id it does not contain, or after a transient failure. Failed
//! fetches are never cached, so the next caller retries.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use fail::fail_point;
use moka::{
    future::Cache,
    ops::compute::{CompResult, Op},
};

use crate::{
    error::{AuthError, FetchError, Result},
    fetcher::{JwksEndpoint, KeySetFetcher},
    key_set::KeySet,
    metrics::AuthMetrics,
};

/// Default number of distinct key-set endpoints kept.
pub const DEFAULT_KEY_SET_CAPACITY: u64 = 1_000;

/// Cache of fetched key sets, keyed by endpoint URL.
pub struct KeySetCache {
    sets: Cache<String, Arc<KeySet>>,
    fetcher: Arc<dyn KeySetFetcher>,
    generation: AtomicU64,
    metrics: Arc<AuthMetrics>,
}

impl KeySetCache {
    /// Create a cache holding at most `capacity` endpoints.
    pub fn new(fetcher: Arc<dyn KeySetFetcher>, capacity: u64, metrics: Arc<AuthMetrics>) -> Self {
        let sets = Cache::builder().max_capacity(capacity).build();
        Self { sets, fetcher, generation: AtomicU64::new(0), metrics }
    }

    /// Key set for `endpoint`, fetching it on a miss.
    ///
    /// Concurrent callers for the same endpoint during a cold miss share one
    /// fetch and all receive its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySetFetch`] if the fetch fails.
    #[tracing::instrument(skip(self, endpoint), fields(endpoint = %endpoint.url))]
    pub async fn get_key_set(&self, endpoint: &JwksEndpoint) -> Result<Arc<KeySet>> {
        self.sets
            .try_get_with_by_ref(&endpoint.url, self.fetch(endpoint))
            .await
            .map_err(|e: Arc<FetchError>| AuthError::key_set_fetch(&endpoint.url, (*e).clone()))
    }

    /// Fetch `endpoint` again, bypassing the cached set.
    ///
    /// `seen_generation` is the generation of the set the caller found
    /// lacking. If the cache already holds a newer set, that set is returned
    /// without another fetch, so a burst of callers that all missed the same
    /// key id produces one refresh. `None` always fetches.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySetFetch`] if the fetch fails; the previously
    /// cached set, if any, is kept.
    #[tracing::instrument(skip(self, endpoint), fields(endpoint = %endpoint.url))]
    pub async fn refresh(
        &self,
        endpoint: &JwksEndpoint,
        seen_generation: Option<u64>,
    ) -> Result<Arc<KeySet>> {
        self.metrics.record_forced_refresh();

        let outcome = self
            .sets
            .entry_by_ref(&endpoint.url)
            .and_try_compute_with(|existing| async move {
                if let (Some(entry), Some(seen)) = (&existing, seen_generation) {
                    if entry.value().generation() > seen {
                        tracing::debug!(
                            generation = entry.value().generation(),
                            "Key set already refreshed by another caller"
                        );
                        return Ok(Op::Nop);
                    }
                }
                self.fetch(endpoint).await.map(Op::Put)
            })
            .await
            .map_err(|e| AuthError::key_set_fetch(&endpoint.url, e))?;

        match outcome {
            CompResult::Inserted(entry)
            | CompResult::ReplacedWith(entry)
            | CompResult::Unchanged(entry) => Ok(entry.into_value()),
            CompResult::StillNone(_) | CompResult::Removed(_) => Err(AuthError::key_set_fetch(
                &endpoint.url,
                FetchError::permanent("key set vanished during refresh"),
            )),
        }
    }

    /// Drop the cached set for `endpoint`.
    pub async fn invalidate(&self, endpoint: &JwksEndpoint) {
        self.sets.invalidate(&endpoint.url).await;
    }

    /// Number of cached endpoints. Approximate until pending maintenance runs.
    pub fn entry_count(&self) -> u64 {
        self.sets.entry_count()
    }

    async fn fetch(&self, endpoint: &JwksEndpoint) -> std::result::Result<Arc<KeySet>, FetchError> {
        fail_point!("key-set-before-fetch", |_| {
            Err(FetchError::transient("fail point: key-set-before-fetch"))
        });

        self.metrics.record_fetch();
        let body = self.fetcher.fetch(endpoint).await.map_err(|e| {
            self.metrics.record_fetch_failure();
            tracing::warn!(
                endpoint = %endpoint.url,
                transient = e.is_transient(),
                error = %e,
                "Key set fetch failed"
            );
            e
        })?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let set = KeySet::from_jwks(&body, generation).map_err(|e| {
            self.metrics.record_fetch_failure();
            tracing::warn!(endpoint = %endpoint.url, error = %e, "Key set document rejected");
            e
        })?;

        tracing::debug!(endpoint = %endpoint.url, keys = set.len(), generation, "Fetched key set");
        Ok(Arc::new(set))
    }
}
