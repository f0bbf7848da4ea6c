// ── Executor lifecycle events and counters ──

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ravenly_api::Topology;

/// Lifecycle notifications broadcast by a [`RequestExecutor`](super::RequestExecutor).
///
/// Delivered through a `broadcast` channel: slow consumers observe
/// `Lagged` rather than slowing down request execution.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    BeforeRequest {
        database: String,
        url: String,
        command: &'static str,
        attempt: u32,
    },
    SucceedRequest {
        database: String,
        url: String,
        status: u16,
        from_cache: bool,
    },
    FailedRequest {
        database: String,
        url: String,
        error: String,
    },
    TopologyUpdated {
        database: String,
        topology: Arc<Topology>,
    },
}

/// Read-only diagnostic counters.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    aggressive_cache_hits: AtomicU64,
    failovers: AtomicU64,
    topology_updates: AtomicU64,
}

/// Point-in-time copy of [`ExecutorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStatsSnapshot {
    /// HTTP requests sent (including conditional ones answered with 304).
    pub requests: u64,
    /// Requests answered from the cache after a 304.
    pub cache_hits: u64,
    /// Requests answered from the cache without any network call.
    pub aggressive_cache_hits: u64,
    pub failovers: u64,
    pub topology_updates: u64,
}

impl ExecutorStats {
    pub fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            aggressive_cache_hits: self.aggressive_cache_hits.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            topology_updates: self.topology_updates.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn aggressive_cache_hit(&self) {
        self.aggressive_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn topology_update(&self) {
        self.topology_updates.fetch_add(1, Ordering::Relaxed);
    }
}
