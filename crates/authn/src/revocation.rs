//! Revoked token tracking.
//!
//! A revoked token is identified by its token identifier
//! ([`SignedTokenHandle::token_identifier`](crate::token::SignedTokenHandle::token_identifier)):
//! the `jti` claim, or the signature when the token has none. Entries expire
//! with the token they revoke, so the list never outgrows the set of tokens
//! that could still validate.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use trustgate_authn::revocation::{InMemoryRevocationList, RevocationList};
//!
//! # async fn demo() {
//! let revoked = InMemoryRevocationList::new(10_000);
//! revoked.revoke("jti-001", Duration::from_secs(300)).await;
//! assert!(revoked.is_revoked("jti-001").await);
//! # }
//! ```

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::{future::Cache, policy::EvictionPolicy};

/// Lookup of revoked token identifiers.
#[async_trait]
pub trait RevocationList: Send + Sync {
    /// Mark `token_id` revoked for the next `expires_in`.
    ///
    /// Revoking an identifier twice keeps the later expiry.
    async fn revoke(&self, token_id: &str, expires_in: Duration);

    /// Whether `token_id` is currently revoked.
    async fn is_revoked(&self, token_id: &str) -> bool;
}

/// Per-entry expiry holding the absolute instant the revocation lapses.
struct RevocationExpiry;

impl moka::Expiry<String, Instant> for RevocationExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Instant,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Instant,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.saturating_duration_since(updated_at))
    }
}

/// In-memory revocation list backed by a [`moka::future::Cache`].
///
/// Capacity-bounded with LRU eviction in addition to per-entry expiry.
pub struct InMemoryRevocationList {
    /// Token identifier → instant the revocation lapses.
    revoked: Cache<String, Instant>,
}

impl InMemoryRevocationList {
    /// Track at most `max_capacity` revoked identifiers.
    pub fn new(max_capacity: u64) -> Self {
        let revoked = Cache::builder()
            .name("revoked_tokens")
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(RevocationExpiry)
            .build();
        Self { revoked }
    }

    /// Number of tracked identifiers. Approximate until pending maintenance runs.
    pub fn len(&self) -> u64 {
        self.revoked.entry_count()
    }

    /// True when nothing is revoked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RevocationList for InMemoryRevocationList {
    async fn revoke(&self, token_id: &str, expires_in: Duration) {
        let lapses_at = Instant::now() + expires_in;
        let key = token_id.to_owned();
        let kept = match self.revoked.get(&key).await {
            Some(existing) if existing > lapses_at => existing,
            _ => lapses_at,
        };
        self.revoked.insert(key, kept).await;
        tracing::debug!(
            token = %crate::token::fingerprint(token_id),
            expires_in_secs = expires_in.as_secs(),
            "Token revoked"
        );
    }

    async fn is_revoked(&self, token_id: &str) -> bool {
        self.revoked.get(token_id).await.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_token_not_revoked() {
        let list = InMemoryRevocationList::new(100);
        assert!(!list.is_revoked("jti-001").await);
    }

    #[tokio::test]
    async fn test_revoked_token_reported() {
        let list = InMemoryRevocationList::new(100);
        list.revoke("jti-002", Duration::from_secs(60)).await;
        assert!(list.is_revoked("jti-002").await);
        assert!(!list.is_revoked("jti-003").await);
    }

    #[tokio::test]
    async fn test_revocation_lapses_with_token() {
        let list = InMemoryRevocationList::new(100);
        list.revoke("jti-short", Duration::from_millis(50)).await;
        assert!(list.is_revoked("jti-short").await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!list.is_revoked("jti-short").await);
    }

    #[tokio::test]
    async fn test_second_revoke_keeps_later_expiry() {
        let list = InMemoryRevocationList::new(100);
        list.revoke("jti-x", Duration::from_secs(60)).await;
        list.revoke("jti-x", Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(list.is_revoked("jti-x").await);
    }

    #[tokio::test]
    async fn test_capacity_bounded() {
        let list = InMemoryRevocationList::new(10);
        for i in 0..50 {
            list.revoke(&format!("jti-{i}"), Duration::from_secs(60)).await;
        }
        list.revoked.run_pending_tasks().await;
        assert!(list.len() <= 10);
    }
}
