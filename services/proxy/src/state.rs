//! Shared server state: the active backend snapshot and connection tracking.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tcpfan_backends::BackendConfig;
use tokio::sync::Notify;
use tracing::info;

/// The currently active backend configuration.
///
/// Uses ArcSwap for lock-free reads on the accept path. Reload builds a
/// complete [`BackendConfig`] first and publishes it with one pointer swap;
/// connections that already loaded the previous snapshot keep using it.
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    inner: Arc<ArcSwap<BackendConfig>>,
}

impl ActiveConfig {
    pub fn new(initial: BackendConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Get the current snapshot.
    pub fn load(&self) -> Arc<BackendConfig> {
        self.inner.load_full()
    }

    /// Atomically publish a new snapshot, returning the one it replaced.
    pub fn replace(&self, config: BackendConfig) -> Arc<BackendConfig> {
        let host_count = config.hosts().len();
        let total_weight = config.total_weight();
        let previous = self.inner.swap(Arc::new(config));

        info!(host_count, total_weight, "Backend config swapped atomically");
        previous
    }
}

/// Counts in-flight connections and lets shutdown wait for them to drain.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    accepted: AtomicU64,
    drained: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. The connection counts as active until the
    /// returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Connections currently in flight.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Connections accepted since start.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Wait until no connection is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent final drop is not missed.
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard for one tracked connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}
