//! Discovery stream metrics.
//!
//! Counters are independent and monotonic, so `Ordering::Relaxed` is
//! sufficient. Create one [`SyncMetrics`] per process and share it by `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for the discovery stream.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    responses: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    stream_failures: AtomicU64,
    issuers_installed: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    /// Channel establishment attempts.
    pub connect_attempts: u64,
    /// Attempts that failed before streaming.
    pub connect_failures: u64,
    /// Discovery responses received.
    pub responses: u64,
    /// Responses acknowledged.
    pub acks: u64,
    /// Responses rejected.
    pub nacks: u64,
    /// Streams that ended with an error or closed by the server.
    pub stream_failures: u64,
    /// Issuers installed across all accepted responses.
    pub issuers_installed: u64,
}

impl SyncMetrics {
    /// Fresh, zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack(&self, issuers: usize) {
        self.acks.fetch_add(1, Ordering::Relaxed);
        self.issuers_installed.fetch_add(issuers as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_nack(&self) {
        self.nacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stream_failure(&self) {
        self.stream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            issuers_installed: self.issuers_installed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = SyncMetrics::new();
        metrics.record_response();
        metrics.record_ack(3);
        metrics.record_response();
        metrics.record_nack();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.responses, 2);
        assert_eq!(snapshot.acks, 1);
        assert_eq!(snapshot.nacks, 1);
        assert_eq!(snapshot.issuers_installed, 3);
        assert_eq!(snapshot.stream_failures, 0);
    }
}
