// ── Node selection ──
//
// Holds the current topology snapshot plus per-node health. The
// topology is an `ArcSwap`: readers take an `Arc<Topology>` and keep
// using it for the whole command, refreshes replace it atomically.
// Health lives in a `DashMap` keyed by node URL so marking a node
// unavailable never needs a lock held across I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use ravenly_api::{ServerNode, Topology};

use crate::config::{BackoffConfig, ReadBalanceBehavior};

#[derive(Debug, Clone, Copy)]
struct NodeHealth {
    unavailable_until: Instant,
    failures: u32,
}

#[derive(Debug)]
pub(crate) struct NodeSelector {
    topology: ArcSwap<Topology>,
    health: DashMap<String, NodeHealth>,
    preferred: AtomicUsize,
    round_robin: AtomicUsize,
    read_balance: ReadBalanceBehavior,
    backoff: BackoffConfig,
}

impl NodeSelector {
    pub(crate) fn new(
        topology: Topology,
        read_balance: ReadBalanceBehavior,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            topology: ArcSwap::from_pointee(topology),
            health: DashMap::new(),
            preferred: AtomicUsize::new(0),
            round_robin: AtomicUsize::new(0),
            read_balance,
            backoff,
        }
    }

    pub(crate) fn topology(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    /// Install `topology` if it is newer than the current one (or
    /// `force` is set). Returns whether the snapshot was replaced.
    pub(crate) fn on_update_topology(&self, topology: Topology, force: bool) -> bool {
        let current = self.topology.load();
        if !force && topology.etag <= current.etag {
            debug!(
                current = current.etag,
                received = topology.etag,
                "ignoring topology that is not newer"
            );
            return false;
        }
        if topology.is_empty() {
            debug!("ignoring topology with no nodes");
            return false;
        }

        let preferred_url = current
            .nodes
            .get(self.preferred.load(Ordering::Relaxed))
            .map(|n| n.url.clone());

        self.health
            .retain(|url, _| topology.nodes.iter().any(|n| &n.url == url));
        let preferred = preferred_url
            .and_then(|url| topology.nodes.iter().position(|n| n.url == url))
            .unwrap_or(0);

        self.topology.store(Arc::new(topology));
        self.preferred.store(preferred, Ordering::Relaxed);
        true
    }

    // ── Health ───────────────────────────────────────────────────────

    pub(crate) fn is_available(&self, node: &ServerNode) -> bool {
        self.health
            .get(&node.url)
            .is_none_or(|h| h.unavailable_until <= Instant::now())
    }

    /// Record a failure and return the backoff window applied.
    pub(crate) fn mark_unavailable(&self, node: &ServerNode) -> Duration {
        let now = Instant::now();
        let mut entry = self.health.entry(node.url.clone()).or_insert(NodeHealth {
            unavailable_until: now,
            failures: 0,
        });
        entry.failures = entry.failures.saturating_add(1);
        let delay = calculate_backoff(entry.failures, &self.backoff);
        entry.unavailable_until = now + delay;
        drop(entry);

        let topology = self.topology.load();
        if let Some(idx) = topology.index_of(node) {
            // Move the preference off a failed node, but don't fight a
            // concurrent success that already moved it elsewhere.
            let next = (idx + 1) % topology.len();
            let _ = self.preferred.compare_exchange(
                idx,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
        delay
    }

    /// A request succeeded on `node`: clear its backoff and stick to it.
    pub(crate) fn record_success(&self, node: &ServerNode) {
        self.health.remove(&node.url);
        if self.read_balance == ReadBalanceBehavior::None {
            if let Some(idx) = self.topology.load().index_of(node) {
                self.preferred.store(idx, Ordering::Relaxed);
            }
        }
    }

    // ── Candidate ordering ───────────────────────────────────────────

    /// Indexes into `topology.nodes` in the order they should be tried:
    /// available nodes starting at the preferred (or round-robin) one,
    /// then unavailable nodes soonest-to-recover first.
    pub(crate) fn candidates(&self, topology: &Topology, is_read: bool) -> Vec<usize> {
        let len = topology.len();
        if len == 0 {
            return Vec::new();
        }

        let start = if is_read && self.read_balance == ReadBalanceBehavior::RoundRobin {
            self.round_robin.fetch_add(1, Ordering::Relaxed) % len
        } else {
            self.preferred.load(Ordering::Relaxed) % len
        };

        let now = Instant::now();
        let mut available = Vec::with_capacity(len);
        let mut unavailable = Vec::new();
        for offset in 0..len {
            let idx = (start + offset) % len;
            match self.health.get(&topology.nodes[idx].url) {
                Some(h) if h.unavailable_until > now => unavailable.push((h.unavailable_until, idx)),
                _ => available.push(idx),
            }
        }
        unavailable.sort_by_key(|(until, _)| *until);
        available.extend(unavailable.into_iter().map(|(_, idx)| idx));
        available
    }

    /// The node new work should go to right now.
    pub(crate) fn preferred_node(&self) -> Option<ServerNode> {
        let topology = self.topology();
        self.candidates(&topology, false)
            .first()
            .and_then(|&idx| topology.nodes.get(idx).cloned())
    }
}

/// `delay = min(initial * 2^(failures - 1), max)`
fn calculate_backoff(failures: u32, config: &BackoffConfig) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    config
        .initial
        .checked_mul(1u32 << exponent)
        .unwrap_or(config.max)
        .min(config.max)
}
