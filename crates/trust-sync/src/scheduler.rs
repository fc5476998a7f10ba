//! Fixed-delay reconnect scheduling.
//!
//! The scheduler owns at most one retry task per client. A task sleeps for
//! the initial delay, then calls [`DiscoveryClient::connect`] repeatedly with
//! a fixed delay between the end of one attempt and the start of the next.
//! A client that reaches a healthy stream stops its own task; a stream that
//! fails starts it again.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{client::DiscoveryClient, config::SyncConfig, error::SyncError};

struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

/// Reconnect scheduler shared by discovery clients.
///
/// Tasks hold only a weak reference to their client; dropping the last
/// client handle ends its task at the next tick.
pub struct SyncScheduler {
    initial_delay: Duration,
    period: Duration,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl SyncScheduler {
    /// Scheduler waiting `initial_delay` before the first attempt and
    /// `period` between attempts.
    pub fn new(initial_delay: Duration, period: Duration) -> Self {
        Self { initial_delay, period, tasks: Mutex::new(HashMap::new()) }
    }

    /// Scheduler using the delays of `config`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.initial_delay, config.retry_period)
    }

    /// Delay between attempts.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Schedule reconnect attempts for `client`.
    ///
    /// Returns `false` without doing anything if an active task already
    /// exists for the client. Must be called within a tokio runtime.
    pub fn start_scheduling(&self, client: &Arc<DiscoveryClient>) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.get(client.name()).is_some_and(ScheduledTask::is_active) {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(retry_loop(
            Arc::downgrade(client),
            cancel.clone(),
            self.initial_delay,
            self.period,
        ));
        tasks.insert(client.name().to_owned(), ScheduledTask { cancel, handle });

        tracing::info!(
            client = client.name(),
            period = %humantime::format_duration(self.period),
            "Scheduled discovery reconnects"
        );
        true
    }

    /// Cancel the task of the client named `name`.
    ///
    /// An attempt already in progress completes; no further attempt starts.
    /// Returns whether a task was cancelled.
    pub fn stop_scheduling(&self, name: &str) -> bool {
        let Some(task) = self.tasks.lock().remove(name) else {
            return false;
        };
        task.cancel.cancel();
        tracing::debug!(client = name, "Stopped discovery reconnects");
        true
    }

    /// Whether the client named `name` has an active task.
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks.lock().get(name).is_some_and(ScheduledTask::is_active)
    }

    /// Cancel every task.
    pub fn shutdown(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.cancel.cancel();
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn retry_loop(
    client: Weak<DiscoveryClient>,
    cancel: CancellationToken,
    initial_delay: Duration,
    period: Duration,
) {
    let mut delay = initial_delay;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {},
        }

        let Some(client) = client.upgrade() else {
            break;
        };
        match client.connect().await {
            Ok(()) => {},
            Err(SyncError::Shutdown) => break,
            Err(e) => {
                tracing::warn!(client = client.name(), error = %e, "Scheduled reconnect failed");
            },
        }
        delay = period;
    }
}
