//! Validation result caches.
//!
//! [`ResultCache`] is one bounded cache with sliding (last-access) expiry,
//! least-recently-used eviction and an optional per-entry lifetime. The
//! gateway keeps several of them per organization, see
//! [`CacheRegistry`](crate::cache_registry::CacheRegistry).
//!
//! Values are cloned out on read and replaced whole on write; nothing hands
//! out a reference into a cached entry.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use moka::{future::Cache, policy::EvictionPolicy};
use sha2::{Digest, Sha256};

use crate::config::CacheSettings;

/// Cache identity of a token.
///
/// The full token string, or `sha256:<hex>` for tokens longer than the
/// configured threshold. The prefix keeps a hashed key from colliding with a
/// short token that happens to look like a digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenKey(Arc<str>);

impl TokenKey {
    /// Key for `token`, hashing it when longer than `hash_threshold` bytes.
    pub fn new(token: &str, hash_threshold: usize) -> Self {
        if token.len() > hash_threshold {
            let digest = Sha256::digest(token.as_bytes());
            Self(Arc::from(format!("sha256:{}", hex::encode(digest))))
        } else {
            Self(Arc::from(token))
        }
    }

    /// Whether the key is a digest rather than the token itself.
    pub fn is_hashed(&self) -> bool {
        self.0.starts_with("sha256:")
    }
}

impl fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenKey({})", crate::token::fingerprint(&self.0))
    }
}

#[derive(Clone)]
struct Timed<V> {
    value: V,
    deadline: Option<Instant>,
}

/// Sliding idle expiry, capped by an optional absolute deadline per entry.
struct IdleOrDeadline {
    idle: Duration,
}

impl IdleOrDeadline {
    fn remaining<V>(&self, value: &Timed<V>, at: Instant) -> Option<Duration> {
        Some(match value.deadline {
            Some(deadline) => self.idle.min(deadline.saturating_duration_since(at)),
            None => self.idle,
        })
    }
}

impl<V> moka::Expiry<TokenKey, Timed<V>> for IdleOrDeadline {
    fn expire_after_create(
        &self,
        _key: &TokenKey,
        value: &Timed<V>,
        created_at: Instant,
    ) -> Option<Duration> {
        self.remaining(value, created_at)
    }

    fn expire_after_read(
        &self,
        _key: &TokenKey,
        value: &Timed<V>,
        read_at: Instant,
        _duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        self.remaining(value, read_at)
    }

    fn expire_after_update(
        &self,
        _key: &TokenKey,
        value: &Timed<V>,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        self.remaining(value, updated_at)
    }
}

/// A bounded, idle-expiring cache of per-token values.
pub struct ResultCache<V> {
    name: &'static str,
    inner: Cache<TokenKey, Timed<V>>,
}

impl<V> ResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache named `name` (used in logs) with the given bounds.
    pub fn new(name: &'static str, settings: CacheSettings) -> Self {
        let inner = Cache::builder()
            .name(name)
            .max_capacity(settings.max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(IdleOrDeadline { idle: settings.idle_timeout })
            .build();
        Self { name, inner }
    }

    /// Cached value for `key`, refreshing its idle timer.
    pub async fn get(&self, key: &TokenKey) -> Option<V> {
        self.inner.get(key).await.map(|timed| timed.value)
    }

    /// Store `value`, replacing any previous entry.
    ///
    /// With `ttl`, the entry also expires that long after insertion, however
    /// often it is read.
    pub async fn put(&self, key: TokenKey, value: V, ttl: Option<Duration>) {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.inner.insert(key, Timed { value, deadline }).await;
    }

    /// Cached value, or the result of `init` stored without a deadline.
    ///
    /// Concurrent callers for the same key share one `init`.
    pub async fn get_or_insert_with(&self, key: TokenKey, init: impl Future<Output = V>) -> V {
        self.inner
            .get_with(key, async move { Timed { value: init.await, deadline: None } })
            .await
            .value
    }

    /// Remove `key`.
    pub async fn invalidate(&self, key: &TokenKey) {
        self.inner.invalidate(key).await;
    }

    /// Remove every entry.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Whether `key` is present. Does not count as an access.
    pub fn contains(&self, key: &TokenKey) -> bool {
        self.inner.contains_key(key)
    }

    /// Number of entries. Approximate until [`run_pending_tasks`](Self::run_pending_tasks).
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Apply pending evictions and expirations.
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Cache name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}
