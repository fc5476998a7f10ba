//! Validation metrics.
//!
//! One [`AuthMetrics`] is created per process and shared by `Arc` between the
//! key-set cache, the key source and the authenticator. Counters are
//! independent and monotonic, so `Ordering::Relaxed` is sufficient; a
//! [`snapshot`](AuthMetrics::snapshot) may be marginally inconsistent across
//! counters, which is acceptable for telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for the validation path.
#[derive(Debug, Default)]
pub struct AuthMetrics {
    validations: AtomicU64,
    valid: AtomicU64,
    invalid: AtomicU64,
    expired: AtomicU64,
    parse_errors: AtomicU64,
    result_cache_hits: AtomicU64,
    result_cache_misses: AtomicU64,
    key_set_fetches: AtomicU64,
    key_set_fetch_failures: AtomicU64,
    forced_refreshes: AtomicU64,
}

/// Point-in-time copy of [`AuthMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthMetricsSnapshot {
    /// Validation requests received.
    pub validations: u64,
    /// Requests answered with a valid result.
    pub valid: u64,
    /// Requests answered with an invalid-credential result.
    pub invalid: u64,
    /// Requests answered with an expired result.
    pub expired: u64,
    /// Requests rejected as malformed.
    pub parse_errors: u64,
    /// Answers served from the result cache.
    pub result_cache_hits: u64,
    /// Requests that missed the result cache.
    pub result_cache_misses: u64,
    /// Key-set network fetches started.
    pub key_set_fetches: u64,
    /// Key-set fetches that failed.
    pub key_set_fetch_failures: u64,
    /// Cache-bypassing refreshes triggered by an unknown key id or transient failure.
    pub forced_refreshes: u64,
}

impl AuthMetrics {
    /// Fresh, zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_validation(&self) {
        self.validations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, code: crate::validator::ValidationCode) {
        use crate::validator::ValidationCode;
        let counter = match code {
            ValidationCode::Success => &self.valid,
            ValidationCode::TokenExpired => &self.expired,
            ValidationCode::InvalidCredentials => &self.invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.result_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.result_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch(&self) {
        self.key_set_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_failure(&self) {
        self.key_set_fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forced_refresh(&self) {
        self.forced_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> AuthMetricsSnapshot {
        AuthMetricsSnapshot {
            validations: self.validations.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            result_cache_hits: self.result_cache_hits.load(Ordering::Relaxed),
            result_cache_misses: self.result_cache_misses.load(Ordering::Relaxed),
            key_set_fetches: self.key_set_fetches.load(Ordering::Relaxed),
            key_set_fetch_failures: self.key_set_fetch_failures.load(Ordering::Relaxed),
            forced_refreshes: self.forced_refreshes.load(Ordering::Relaxed),
        }
    }
}

impl AuthMetricsSnapshot {
    /// Fraction of requests answered from the result cache, 0.0 when idle.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.result_cache_hits + self.result_cache_misses;
        if total == 0 { 0.0 } else { self.result_cache_hits as f64 / total as f64 }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::validator::ValidationCode;

    #[test]
    fn test_outcomes_land_in_separate_counters() {
        let metrics = AuthMetrics::new();
        metrics.record_outcome(ValidationCode::Success);
        metrics.record_outcome(ValidationCode::Success);
        metrics.record_outcome(ValidationCode::TokenExpired);
        metrics.record_outcome(ValidationCode::InvalidCredentials);

        let snap = metrics.snapshot();
        assert_eq!(snap.valid, 2);
        assert_eq!(snap.expired, 1);
        assert_eq!(snap.invalid, 1);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = AuthMetrics::new();
        assert_eq!(metrics.snapshot().cache_hit_rate(), 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        assert!((metrics.snapshot().cache_hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
