// ── Aggressive-cache scopes ──
//
// Each executor keeps a stack of entered scopes. Entering pushes an
// id-tagged value and returns a guard; dropping the guard removes that
// id wherever it sits, so guards may end in any order. The innermost
// live scope is published through an `ArcSwapOption` for lock-free reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;

/// What the store does while aggressive caching is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum AggressiveCacheMode {
    /// Open the change feed and drop freshness on `AggressiveCacheChange`.
    #[default]
    TrackChanges,
    /// Serve cached bodies until they age out, without listening.
    DoNotTrackChanges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggressiveCacheOptions {
    /// Maximum age of a cached body served without a round trip.
    pub duration: Duration,
    pub mode: AggressiveCacheMode,
}

impl AggressiveCacheOptions {
    pub fn new(duration: Duration, mode: AggressiveCacheMode) -> Self {
        Self { duration, mode }
    }
}

/// Per-call override of the executor's current scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheScope {
    /// Use whatever scope the executor is in.
    #[default]
    Inherit,
    /// No aggressive caching for this call.
    Disabled,
    Aggressive(AggressiveCacheOptions),
}

/// Stack of entered scopes; the innermost live guard wins.
#[derive(Debug, Default)]
pub(crate) struct ScopeStack {
    entries: Mutex<Vec<(u64, Option<AggressiveCacheOptions>)>>,
    next_id: AtomicU64,
    current: ArcSwapOption<AggressiveCacheOptions>,
}

impl ScopeStack {
    fn entries(&self) -> MutexGuard<'_, Vec<(u64, Option<AggressiveCacheOptions>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, entries: &[(u64, Option<AggressiveCacheOptions>)]) {
        let top = entries.last().and_then(|(_, options)| *options);
        self.current.store(top.map(Arc::new));
    }

    fn push(&self, options: Option<AggressiveCacheOptions>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries();
        entries.push((id, options));
        self.publish(&entries);
        id
    }

    fn pop(&self, id: u64) {
        let mut entries = self.entries();
        entries.retain(|(entry, _)| *entry != id);
        self.publish(&entries);
    }

    fn current(&self) -> Option<AggressiveCacheOptions> {
        self.current.load().as_deref().copied()
    }
}

pub(crate) type ScopeSlot = Arc<ScopeStack>;

/// Ends its aggressive-cache scope when dropped.
#[must_use = "the scope ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct AggressiveCacheGuard {
    slot: ScopeSlot,
    id: u64,
}

impl AggressiveCacheGuard {
    pub(crate) fn enter(slot: &ScopeSlot, next: Option<AggressiveCacheOptions>) -> Self {
        let id = slot.push(next);
        Self {
            slot: Arc::clone(slot),
            id,
        }
    }
}

impl Drop for AggressiveCacheGuard {
    fn drop(&mut self) {
        self.slot.pop(self.id);
    }
}

pub(crate) fn resolve(slot: &ScopeSlot, scope: CacheScope) -> Option<AggressiveCacheOptions> {
    match scope {
        CacheScope::Inherit => slot.current(),
        CacheScope::Disabled => None,
        CacheScope::Aggressive(options) => Some(options),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(secs: u64) -> AggressiveCacheOptions {
        AggressiveCacheOptions::new(Duration::from_secs(secs), AggressiveCacheMode::TrackChanges)
    }

    #[test]
    fn nested_scopes_restore_in_order() {
        let slot = ScopeSlot::default();
        assert_eq!(resolve(&slot, CacheScope::Inherit), None);

        {
            let _outer = AggressiveCacheGuard::enter(&slot, Some(opts(60)));
            assert_eq!(resolve(&slot, CacheScope::Inherit), Some(opts(60)));
            {
                let _inner = AggressiveCacheGuard::enter(&slot, None);
                assert_eq!(resolve(&slot, CacheScope::Inherit), None);
            }
            assert_eq!(resolve(&slot, CacheScope::Inherit), Some(opts(60)));
        }
        assert_eq!(resolve(&slot, CacheScope::Inherit), None);
    }

    #[test]
    fn explicit_scope_overrides_slot() {
        let slot = ScopeSlot::default();
        let _guard = AggressiveCacheGuard::enter(&slot, Some(opts(60)));
        assert_eq!(resolve(&slot, CacheScope::Disabled), None);
        assert_eq!(resolve(&slot, CacheScope::Aggressive(opts(5))), Some(opts(5)));
    }

    #[test]
    fn guards_dropped_out_of_order() {
        let slot = ScopeSlot::default();
        let outer = AggressiveCacheGuard::enter(&slot, Some(opts(60)));
        let inner = AggressiveCacheGuard::enter(&slot, Some(opts(5)));

        drop(outer);
        assert_eq!(resolve(&slot, CacheScope::Inherit), Some(opts(5)));

        drop(inner);
        assert_eq!(resolve(&slot, CacheScope::Inherit), None);
    }

    #[test]
    fn disabling_scope_outlived_by_its_parent() {
        let slot = ScopeSlot::default();
        let enabled = AggressiveCacheGuard::enter(&slot, Some(opts(60)));
        let disabled = AggressiveCacheGuard::enter(&slot, None);

        drop(enabled);
        assert_eq!(resolve(&slot, CacheScope::Inherit), None);
        drop(disabled);
        assert_eq!(resolve(&slot, CacheScope::Inherit), None);

        let _again = AggressiveCacheGuard::enter(&slot, Some(opts(1)));
        assert_eq!(resolve(&slot, CacheScope::Inherit), Some(opts(1)));
    }
}
