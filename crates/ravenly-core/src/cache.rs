// ── HTTP response cache ──
//
// Bounded ETag cache shared by every in-flight command of one executor.
// Entries are immutable `Arc`s swapped whole, so a reader never sees a
// torn entry. Aggressive-cache invalidation bumps a generation counter
// instead of dropping entries: stale entries can no longer be served
// without a round trip, but their ETag still makes the next request
// conditional.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CacheConfig;

/// One cached response.
#[derive(Debug)]
pub struct CacheEntry {
    pub etag: String,
    pub body: Bytes,
    /// When the server last vouched for this body (stored or 304).
    confirmed_at: Instant,
    /// Cache generation at `confirmed_at`.
    generation: u64,
    last_access: AtomicU64,
}

impl CacheEntry {
    /// Whether this entry may be served without contacting the server.
    pub fn is_fresh(&self, max_age: Duration, current_generation: u64) -> bool {
        self.generation == current_generation && self.confirmed_at.elapsed() <= max_age
    }

    pub fn age(&self) -> Duration {
        self.confirmed_at.elapsed()
    }
}

/// Concurrent LRU cache of response bodies keyed by request path + query.
#[derive(Debug)]
pub struct HttpCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    max_entries: usize,
    max_bytes: usize,
    total_bytes: AtomicUsize,
    generation: AtomicU64,
    clock: AtomicU64,
}

impl HttpCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: config.max_entries.max(1),
            max_bytes: config.max_bytes,
            total_bytes: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    // ── Lookup ───────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()))?;
        entry.last_access.store(self.tick(), Ordering::Relaxed);
        Some(entry)
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Store a fresh response. Bodies larger than the whole byte budget
    /// are not cached.
    pub fn put(&self, key: &str, etag: &str, body: Bytes) {
        let size = body.len();
        if size > self.max_bytes {
            trace!(key, size, "response too large to cache");
            return;
        }

        let entry = Arc::new(CacheEntry {
            etag: etag.to_owned(),
            body,
            confirmed_at: Instant::now(),
            generation: self.generation(),
            last_access: AtomicU64::new(self.tick()),
        });

        // Count the bytes before the entry becomes visible to removers.
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        if let Some(old) = self.entries.insert(key.to_owned(), entry) {
            self.total_bytes.fetch_sub(old.body.len(), Ordering::Relaxed);
        }
        self.evict_if_needed();
    }

    /// The server answered 304 for `key`: the cached body is current again.
    pub fn mark_confirmed(&self, key: &str) {
        let generation = self.generation();
        let tick = self.tick();
        if let Some(mut slot) = self.entries.get_mut(key) {
            let old = slot.value();
            let refreshed = Arc::new(CacheEntry {
                etag: old.etag.clone(),
                body: old.body.clone(),
                confirmed_at: Instant::now(),
                generation,
                last_access: AtomicU64::new(tick),
            });
            *slot = refreshed;
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, old)) => {
                self.total_bytes.fetch_sub(old.body.len(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            if key.starts_with(prefix) {
                self.total_bytes.fetch_sub(entry.body.len(), Ordering::Relaxed);
                removed += 1;
                false
            } else {
                true
            }
        });
        debug!(prefix, removed, "cache prefix invalidated");
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    // ── Generations ──────────────────────────────────────────────────

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Make every current entry ineligible for aggressive serving.
    pub fn bump_generation(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation = next, "aggressive cache invalidated");
        next
    }

    // ── Stats ────────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    // ── Eviction ─────────────────────────────────────────────────────

    fn over_budget(&self) -> bool {
        self.entries.len() > self.max_entries || self.total_bytes() > self.max_bytes
    }

    /// Drop least-recently-used entries until both budgets hold again.
    fn evict_if_needed(&self) {
        if !self.over_budget() {
            return;
        }

        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|e| (e.value().last_access.load(Ordering::Relaxed), e.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(access, _)| *access);

        let mut evicted = 0usize;
        for (_, key) in by_age {
            if !self.over_budget() {
                break;
            }
            if self.invalidate(&key) {
                evicted += 1;
            }
        }
        debug!(evicted, entries = self.len(), bytes = self.total_bytes(), "cache evicted");
    }
}
