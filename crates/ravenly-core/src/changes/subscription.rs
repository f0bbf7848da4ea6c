// ── Change-feed subscriptions ──
//
// One `SubscriptionState` per watch target (`docs/<id>`, `all-docs`, ...),
// shared by every observable registered for that target. Notifications
// are fanned out to every state; each state's filter decides what its
// listeners see.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use arc_swap::ArcSwapOption;
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use ravenly_api::changes::{
    AggressiveCacheChange, CounterChange, DocumentChange, IndexChange, Notification,
    OperationStatusChange, TimeSeriesChange,
};

use super::DatabaseChanges;
use crate::error::CoreError;

pub(crate) type Filter = Arc<dyn Fn(&Notification) -> bool + Send + Sync>;
type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

// ── Typed extraction ─────────────────────────────────────────────────

/// A change type that can be pulled out of a [`Notification`].
pub trait ChangeKind: Clone + Send + Sync + 'static {
    fn extract(notification: &Notification) -> Option<&Self>;
}

macro_rules! change_kind {
    ($ty:ty, $variant:ident) => {
        impl ChangeKind for $ty {
            fn extract(notification: &Notification) -> Option<&Self> {
                match notification {
                    Notification::$variant(change) => Some(change),
                    _ => None,
                }
            }
        }
    };
}

change_kind!(DocumentChange, Document);
change_kind!(IndexChange, Index);
change_kind!(OperationStatusChange, Operation);
change_kind!(CounterChange, Counter);
change_kind!(TimeSeriesChange, TimeSeries);
change_kind!(AggressiveCacheChange, AggressiveCache);

// ── Watch target ─────────────────────────────────────────────────────

/// What the server is told when a subscription starts and ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WatchTarget {
    pub(crate) key: String,
    pub(crate) watch: &'static str,
    pub(crate) unwatch: Option<&'static str>,
    pub(crate) param: Option<String>,
    pub(crate) params: Option<Vec<String>>,
}

impl WatchTarget {
    pub(crate) fn new(key: impl Into<String>, watch: &'static str) -> Self {
        Self {
            key: key.into(),
            watch,
            unwatch: None,
            param: None,
            params: None,
        }
    }

    pub(crate) fn unwatch(mut self, command: &'static str) -> Self {
        self.unwatch = Some(command);
        self
    }

    pub(crate) fn param(mut self, value: impl Into<String>) -> Self {
        self.param = Some(value.into());
        self
    }

    pub(crate) fn params(mut self, values: Vec<String>) -> Self {
        self.params = Some(values);
        self
    }
}

// ── Shared state ─────────────────────────────────────────────────────

pub(crate) struct SubscriptionState {
    pub(crate) target: WatchTarget,
    filter: Filter,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener: AtomicU64,
    /// Connection id the watch command was last confirmed on; 0 = none.
    watched_on: AtomicU64,
    /// Serializes watch and unwatch commands for this target.
    pub(crate) command_lock: tokio::sync::Mutex<()>,
    pub(crate) last_error: ArcSwapOption<CoreError>,
}

impl std::fmt::Debug for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionState")
            .field("key", &self.target.key)
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl SubscriptionState {
    pub(crate) fn new(target: WatchTarget, filter: Filter) -> Self {
        Self {
            target,
            filter,
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            watched_on: AtomicU64::new(0),
            command_lock: tokio::sync::Mutex::new(()),
            last_error: ArcSwapOption::empty(),
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().map_or(0, |l| l.len())
    }

    pub(crate) fn add_listener(&self, listener: Listener) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, listener);
        }
        id
    }

    /// Remove a listener; returns how many remain.
    pub(crate) fn remove_listener(&self, id: u64) -> usize {
        match self.listeners.lock() {
            Ok(mut listeners) => {
                listeners.remove(&id);
                listeners.len()
            }
            Err(_) => 0,
        }
    }

    pub(crate) fn watched_on(&self) -> u64 {
        self.watched_on.load(Ordering::Acquire)
    }

    pub(crate) fn set_watched_on(&self, conn: u64) {
        self.watched_on.store(conn, Ordering::Release);
    }

    pub(crate) fn dispatch(&self, notification: &Notification) {
        if !(self.filter)(notification) {
            return;
        }
        // Clone out so callbacks may unsubscribe without deadlocking.
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(l) => l.values().cloned().collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(notification);
        }
    }

    pub(crate) fn record_error(&self, error: Arc<CoreError>) {
        self.last_error.store(Some(error));
    }
}

// ── Observable ───────────────────────────────────────────────────────

/// Typed handle on one watch target. Register callbacks with
/// [`subscribe`](Self::subscribe) or pull changes with
/// [`stream`](Self::stream).
pub struct ChangesObservable<T: ChangeKind> {
    changes: DatabaseChanges,
    state: Arc<SubscriptionState>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: ChangeKind> Clone for ChangesObservable<T> {
    fn clone(&self) -> Self {
        Self {
            changes: self.changes.clone(),
            state: Arc::clone(&self.state),
            _kind: PhantomData,
        }
    }
}

impl<T: ChangeKind> std::fmt::Debug for ChangesObservable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesObservable")
            .field("key", &self.state.target.key)
            .finish_non_exhaustive()
    }
}

impl<T: ChangeKind> ChangesObservable<T> {
    pub(crate) fn new(changes: DatabaseChanges, state: Arc<SubscriptionState>) -> Self {
        Self {
            changes,
            state,
            _kind: PhantomData,
        }
    }

    /// Canonical watch-target key, e.g. `docs/users/1`.
    pub fn key(&self) -> &str {
        &self.state.target.key
    }

    /// Invoke `callback` for every matching change until the returned
    /// handle is dropped or unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> ChangesSubscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(move |notification: &Notification| {
            if let Some(change) = T::extract(notification) {
                callback(change);
            }
        });

        // The state may have been retired since this observable was made;
        // join whichever state is registered for the key now.
        let mut state = Arc::clone(&self.state);
        let id = loop {
            let id = state.add_listener(Arc::clone(&listener));
            if self.changes.is_closed() || self.changes.is_registered(&state) {
                break id;
            }
            let registered = self.changes.reattach(&state);
            if Arc::ptr_eq(&registered, &state) {
                break id;
            }
            state.remove_listener(id);
            state = registered;
        };
        debug!(key = %state.target.key, listener = id, "listener added");
        ChangesSubscription {
            changes: self.changes.clone(),
            state,
            id,
            released: AtomicBool::new(false),
        }
    }

    /// Matching changes as a `Stream`. Dropping the stream unsubscribes.
    pub fn stream(&self) -> ChangesStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |change: &T| {
            let _ = tx.send(change.clone());
        });
        ChangesStream {
            inner: UnboundedReceiverStream::new(rx),
            _subscription: subscription,
        }
    }
}

// ── Subscription handle ──────────────────────────────────────────────

/// Registration of one listener. Dropping it unregisters the listener;
/// when the last listener of a target goes, the server is told to stop
/// watching it.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct ChangesSubscription {
    changes: DatabaseChanges,
    state: Arc<SubscriptionState>,
    id: u64,
    released: AtomicBool,
}

impl std::fmt::Debug for ChangesSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesSubscription")
            .field("key", &self.state.target.key)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ChangesSubscription {
    /// Unregister and, if this was the last listener, wait for the
    /// server to confirm the unwatch.
    pub async fn unsubscribe(self) -> Result<(), CoreError> {
        match self.release() {
            Some(state) => self.changes.retire(&state).await,
            None => Ok(()),
        }
    }

    /// Remove the listener once. Returns the state if it is now unused.
    fn release(&self) -> Option<Arc<SubscriptionState>> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        let remaining = self.state.remove_listener(self.id);
        debug!(key = %self.state.target.key, listener = self.id, remaining, "listener removed");
        (remaining == 0).then(|| Arc::clone(&self.state))
    }
}

impl Drop for ChangesSubscription {
    fn drop(&mut self) {
        let Some(state) = self.release() else {
            return;
        };
        let changes = self.changes.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = changes.retire(&state).await {
                        debug!(key = %state.target.key, error = %e, "unwatch failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %state.target.key, "no runtime to send unwatch on drop");
                changes.remove_state(&state);
            }
        }
    }
}

// ── Stream adapter ───────────────────────────────────────────────────

/// `Stream` of typed changes backed by an unbounded channel.
pub struct ChangesStream<T: ChangeKind> {
    inner: UnboundedReceiverStream<T>,
    _subscription: ChangesSubscription,
}

impl<T: ChangeKind> Stream for ChangesStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ravenly_api::changes::DocumentChangeType;

    fn doc(id: &str) -> Notification {
        Notification::Document(DocumentChange {
            change_type: DocumentChangeType::Put,
            id: id.into(),
            collection_name: Some("Users".into()),
            type_name: None,
            change_vector: None,
        })
    }

    #[test]
    fn listeners_are_counted_per_state() {
        let state = SubscriptionState::new(WatchTarget::new("all-docs", "watch-docs"), Arc::new(|_: &Notification| true));
        assert_eq!(state.watched_on(), 0);
        state.set_watched_on(3);
        assert_eq!(state.watched_on(), 3);

        let a = state.add_listener(Arc::new(|_: &Notification| {}));
        let b = state.add_listener(Arc::new(|_: &Notification| {}));
        assert_ne!(a, b);
        assert_eq!(state.remove_listener(a), 1);
        assert_eq!(state.remove_listener(a), 1);
        assert_eq!(state.remove_listener(b), 0);
    }

    #[test]
    fn dispatch_applies_filter() {
        let state = SubscriptionState::new(
            WatchTarget::new("docs/a", "watch-doc").param("a"),
            Arc::new(|n: &Notification| matches!(n, Notification::Document(d) if d.id.eq_ignore_ascii_case("a"))),
        );
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        state.add_listener(Arc::new(move |_: &Notification| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        state.dispatch(&doc("A"));
        state.dispatch(&doc("b"));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn extract_matches_variant() {
        let n = doc("x");
        assert_eq!(DocumentChange::extract(&n).unwrap().id, "x");
        assert!(IndexChange::extract(&n).is_none());
    }
}
