// ── Change feed client ──
//
// One auto-reconnecting WebSocket session per (database, node tag).
// Many typed subscriptions share the socket; control commands are
// correlated with the server's `Confirm` messages by command id. The
// connection loop lives in `worker`, subscription bookkeeping in
// `subscription`.

mod subscription;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ravenly_api::changes::{
    AggressiveCacheChange, ChangesCommandFrame, ChangesSupportedFeatures, CounterChange,
    DocumentChange, IndexChange, Notification, OperationStatusChange, TimeSeriesChange,
};
use ravenly_api::{ServerNode, WebSocketConnector, WebSocketSink};

use crate::config::ChangesConfig;
use crate::error::CoreError;
use crate::executor::RequestExecutor;

pub use subscription::{ChangeKind, ChangesObservable, ChangesStream, ChangesSubscription};

use subscription::{Filter, SubscriptionState, WatchTarget};

const ERROR_CHANNEL_SIZE: usize = 64;

/// Key of the internal subscription that asks for topology pushes.
const TOPOLOGY_KEY: &str = "Topology";

/// Lifecycle of the feed's socket. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Socket write half plus the command-id counter it orders.
struct Writer {
    sink: Option<Box<dyn WebSocketSink>>,
    next_command_id: u64,
}

type OnClose = Box<dyn FnOnce() + Send>;

// ── DatabaseChanges ──────────────────────────────────────────────────

/// Change feed for one database.
///
/// Cheaply cloneable via `Arc<ChangesInner>`. The background connection
/// task keeps the feed alive until [`close`](Self::close) is called.
#[derive(Clone)]
pub struct DatabaseChanges {
    inner: Arc<ChangesInner>,
}

struct ChangesInner {
    database: String,
    node_tag: Option<String>,
    executor: RequestExecutor,
    connector: Arc<dyn WebSocketConnector>,
    config: ChangesConfig,
    status: watch::Sender<ConnectionStatus>,
    writer: Mutex<Writer>,
    confirmations: DashMap<u64, oneshot::Sender<Result<(), CoreError>>>,
    subscriptions: DashMap<String, Arc<SubscriptionState>>,
    errors: broadcast::Sender<Arc<CoreError>>,
    features: watch::Sender<Option<ChangesSupportedFeatures>>,
    /// Bumped on every successful connect; 0 = never connected.
    connection_id: AtomicU64,
    current_node: ArcSwapOption<ServerNode>,
    last_error: ArcSwapOption<CoreError>,
    closed: AtomicBool,
    cancel: CancellationToken,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    on_close: std::sync::Mutex<Option<OnClose>>,
}

impl std::fmt::Debug for DatabaseChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseChanges")
            .field("database", &self.inner.database)
            .field("node_tag", &self.inner.node_tag)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl DatabaseChanges {
    /// Open the feed for `executor`'s database and start connecting in
    /// the background. Must be called inside a tokio runtime.
    pub fn new(
        executor: RequestExecutor,
        connector: Arc<dyn WebSocketConnector>,
        config: ChangesConfig,
        node_tag: Option<String>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (features, _) = watch::channel(None);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_SIZE);

        let changes = Self {
            inner: Arc::new(ChangesInner {
                database: executor.database().to_owned(),
                node_tag,
                executor,
                connector,
                config,
                status,
                writer: Mutex::new(Writer {
                    sink: None,
                    next_command_id: 0,
                }),
                confirmations: DashMap::new(),
                subscriptions: DashMap::new(),
                errors,
                features,
                connection_id: AtomicU64::new(0),
                current_node: ArcSwapOption::empty(),
                last_error: ArcSwapOption::empty(),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                worker: std::sync::Mutex::new(None),
                on_close: std::sync::Mutex::new(None),
            }),
        };

        let handle = tokio::spawn(worker::connection_loop(changes.clone()));
        if let Ok(mut slot) = changes.inner.worker.lock() {
            *slot = Some(handle);
        }
        changes
    }

    /// Run `callback` once when the feed closes (explicitly or because the
    /// database no longer exists).
    pub(crate) fn set_on_close(&self, callback: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.inner.on_close.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn node_tag(&self) -> Option<&str> {
        self.inner.node_tag.as_deref()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Watch connection status transitions.
    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Node the socket is (or was last) connected to.
    pub fn current_node(&self) -> Option<Arc<ServerNode>> {
        self.inner.current_node.load_full()
    }

    /// Errors from the feed: disconnects, server `Error` messages,
    /// undecodable frames.
    pub fn on_error(&self) -> broadcast::Receiver<Arc<CoreError>> {
        self.inner.errors.subscribe()
    }

    pub fn last_connection_state_error(&self) -> Option<Arc<CoreError>> {
        self.inner
            .subscriptions
            .iter()
            .find_map(|s| s.last_error.load_full())
            .or_else(|| self.inner.last_error.load_full())
    }

    /// Wait until the socket is connected.
    pub async fn ensure_connected_now(&self) -> Result<(), CoreError> {
        let mut rx = self.inner.status.subscribe();
        let status = rx
            .wait_for(|s| matches!(s, ConnectionStatus::Connected | ConnectionStatus::Closed))
            .await
            .map_err(|_| CoreError::ChangesClosed)?;
        match *status {
            ConnectionStatus::Closed => Err(CoreError::ChangesClosed),
            _ => Ok(()),
        }
    }

    /// Features the server announced on the current connection.
    pub async fn supported_features(&self) -> Result<ChangesSupportedFeatures, CoreError> {
        let mut rx = self.inner.features.subscribe();
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(CoreError::ChangesClosed),
            features = rx.wait_for(Option::is_some) => {
                let features = features.map_err(|_| CoreError::ChangesClosed)?;
                features.clone().ok_or(CoreError::ChangesClosed)
            }
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Changes to one document.
    pub async fn for_document(&self, id: &str) -> Result<ChangesObservable<DocumentChange>, CoreError> {
        require("document id", id)?;
        let target = WatchTarget::new(format!("docs/{id}"), "watch-doc")
            .unwatch("unwatch-doc")
            .param(id);
        let id = id.to_owned();
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::Document(d) if d.id.eq_ignore_ascii_case(&id))
        })
        .await
    }

    pub async fn for_all_documents(&self) -> Result<ChangesObservable<DocumentChange>, CoreError> {
        let target = WatchTarget::new("all-docs", "watch-docs").unwatch("unwatch-docs");
        self.observe(target, |n: &Notification| matches!(n, Notification::Document(_)))
            .await
    }

    pub async fn for_documents_starting_with(
        &self,
        prefix: &str,
    ) -> Result<ChangesObservable<DocumentChange>, CoreError> {
        require("prefix", prefix)?;
        let target = WatchTarget::new(format!("prefixes/{prefix}"), "watch-prefix")
            .unwatch("unwatch-prefix")
            .param(prefix);
        let prefix = prefix.to_ascii_lowercase();
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::Document(d) if d.id.to_ascii_lowercase().starts_with(&prefix))
        })
        .await
    }

    pub async fn for_documents_in_collection(
        &self,
        collection: &str,
    ) -> Result<ChangesObservable<DocumentChange>, CoreError> {
        require("collection name", collection)?;
        let target = WatchTarget::new(format!("collections/{collection}"), "watch-collection")
            .unwatch("unwatch-collection")
            .param(collection);
        let collection = collection.to_owned();
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::Document(d)
                if d.collection_name.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(&collection)))
        })
        .await
    }

    pub async fn for_index(&self, name: &str) -> Result<ChangesObservable<IndexChange>, CoreError> {
        require("index name", name)?;
        let target = WatchTarget::new(format!("indexes/{name}"), "watch-index")
            .unwatch("unwatch-index")
            .param(name);
        let name = name.to_owned();
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::Index(i) if i.name.eq_ignore_ascii_case(&name))
        })
        .await
    }

    pub async fn for_all_indexes(&self) -> Result<ChangesObservable<IndexChange>, CoreError> {
        let target = WatchTarget::new("all-indexes", "watch-indexes").unwatch("unwatch-indexes");
        self.observe(target, |n: &Notification| matches!(n, Notification::Index(_)))
            .await
    }

    pub async fn for_operation_id(
        &self,
        operation_id: i64,
    ) -> Result<ChangesObservable<OperationStatusChange>, CoreError> {
        let param = operation_id.to_string();
        let target = WatchTarget::new(format!("operations/{param}"), "watch-operation")
            .unwatch("unwatch-operation")
            .param(param);
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::Operation(o) if o.operation_id == operation_id)
        })
        .await
    }

    pub async fn for_all_operations(
        &self,
    ) -> Result<ChangesObservable<OperationStatusChange>, CoreError> {
        let target =
            WatchTarget::new("all-operations", "watch-operations").unwatch("unwatch-operations");
        self.observe(target, |n: &Notification| matches!(n, Notification::Operation(_)))
            .await
    }

    pub async fn for_all_counters(&self) -> Result<ChangesObservable<CounterChange>, CoreError> {
        let target = WatchTarget::new("all-counters", "watch-counters").unwatch("unwatch-counters");
        self.observe(target, |n: &Notification| matches!(n, Notification::Counter(_)))
            .await
    }

    /// A counter name across all documents.
    pub async fn for_counter(&self, name: &str) -> Result<ChangesObservable<CounterChange>, CoreError> {
        require("counter name", name)?;
        let target = WatchTarget::new(format!("counter/{name}"), "watch-counter")
            .unwatch("unwatch-counter")
            .param(name);
        let name = name.to_owned();
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::Counter(c) if c.name.eq_ignore_ascii_case(&name))
        })
        .await
    }

    pub async fn for_counter_of_document(
        &self,
        document_id: &str,
        name: &str,
    ) -> Result<ChangesObservable<CounterChange>, CoreError> {
        require("document id", document_id)?;
        require("counter name", name)?;
        let target = WatchTarget::new(
            format!("document/{document_id}/counter/{name}"),
            "watch-document-counter",
        )
        .unwatch("unwatch-document-counter")
        .params(vec![document_id.to_owned(), name.to_owned()]);
        let (document_id, name) = (document_id.to_owned(), name.to_owned());
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::Counter(c)
                if c.document_id.eq_ignore_ascii_case(&document_id) && c.name.eq_ignore_ascii_case(&name))
        })
        .await
    }

    pub async fn for_counters_of_document(
        &self,
        document_id: &str,
    ) -> Result<ChangesObservable<CounterChange>, CoreError> {
        require("document id", document_id)?;
        let target = WatchTarget::new(
            format!("document/{document_id}/counter"),
            "watch-document-counters",
        )
        .unwatch("unwatch-document-counters")
        .param(document_id);
        let document_id = document_id.to_owned();
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::Counter(c) if c.document_id.eq_ignore_ascii_case(&document_id))
        })
        .await
    }

    pub async fn for_all_time_series(
        &self,
    ) -> Result<ChangesObservable<TimeSeriesChange>, CoreError> {
        let target = WatchTarget::new("all-timeseries", "watch-all-timeseries")
            .unwatch("unwatch-all-timeseries");
        self.observe(target, |n: &Notification| matches!(n, Notification::TimeSeries(_)))
            .await
    }

    /// A time series name across all documents.
    pub async fn for_time_series(
        &self,
        name: &str,
    ) -> Result<ChangesObservable<TimeSeriesChange>, CoreError> {
        require("time series name", name)?;
        let target = WatchTarget::new(format!("timeseries/{name}"), "watch-timeseries")
            .unwatch("unwatch-timeseries")
            .param(name);
        let name = name.to_owned();
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::TimeSeries(t) if t.name.eq_ignore_ascii_case(&name))
        })
        .await
    }

    pub async fn for_time_series_of_document(
        &self,
        document_id: &str,
        name: &str,
    ) -> Result<ChangesObservable<TimeSeriesChange>, CoreError> {
        require("document id", document_id)?;
        require("time series name", name)?;
        let target = WatchTarget::new(
            format!("document/{document_id}/timeseries/{name}"),
            "watch-document-timeseries",
        )
        .unwatch("unwatch-document-timeseries")
        .params(vec![document_id.to_owned(), name.to_owned()]);
        let (document_id, name) = (document_id.to_owned(), name.to_owned());
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::TimeSeries(t)
                if t.document_id.eq_ignore_ascii_case(&document_id) && t.name.eq_ignore_ascii_case(&name))
        })
        .await
    }

    pub async fn for_all_time_series_of_document(
        &self,
        document_id: &str,
    ) -> Result<ChangesObservable<TimeSeriesChange>, CoreError> {
        require("document id", document_id)?;
        let target = WatchTarget::new(
            format!("document/{document_id}/timeseries"),
            "watch-all-document-timeseries",
        )
        .unwatch("unwatch-all-document-timeseries")
        .param(document_id);
        let document_id = document_id.to_owned();
        self.observe(target, move |n: &Notification| {
            matches!(n, Notification::TimeSeries(t) if t.document_id.eq_ignore_ascii_case(&document_id))
        })
        .await
    }

    /// Cache-invalidation hints. The executor's cache reacts to these on
    /// its own; subscribing only adds a listener.
    pub async fn for_aggressive_caching(
        &self,
    ) -> Result<ChangesObservable<AggressiveCacheChange>, CoreError> {
        let target = WatchTarget::new("aggressive-caching", "watch-aggressive-caching")
            .unwatch("unwatch-aggressive-caching");
        self.observe(target, |n: &Notification| matches!(n, Notification::AggressiveCache(_)))
            .await
    }

    async fn observe<T, F>(&self, target: WatchTarget, filter: F) -> Result<ChangesObservable<T>, CoreError>
    where
        T: ChangeKind,
        F: Fn(&Notification) -> bool + Send + Sync + 'static,
    {
        let filter: Filter = Arc::new(filter);
        loop {
            if self.is_closed() {
                return Err(CoreError::ChangesClosed);
            }
            let state = self.state_for(target.clone(), Arc::clone(&filter));
            match self.ensure_watched(&state).await {
                Ok(true) => return Ok(ChangesObservable::new(self.clone(), state)),
                // Retired while we waited for it; register a fresh one.
                Ok(false) => {}
                Err(e) => {
                    if state.listener_count() == 0 {
                        self.remove_state(&state);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn state_for(&self, target: WatchTarget, filter: Filter) -> Arc<SubscriptionState> {
        let key = target.key.clone();
        Arc::clone(
            self.inner
                .subscriptions
                .entry(key)
                .or_insert_with(|| Arc::new(SubscriptionState::new(target, filter)))
                .value(),
        )
    }

    pub(crate) fn is_registered(&self, state: &Arc<SubscriptionState>) -> bool {
        self.inner
            .subscriptions
            .get(&state.target.key)
            .is_some_and(|s| Arc::ptr_eq(s.value(), state))
    }

    /// Put a retired `state` back in the registry unless another state
    /// took its key. Returns the registered state.
    pub(crate) fn reattach(&self, state: &Arc<SubscriptionState>) -> Arc<SubscriptionState> {
        let registered = Arc::clone(
            self.inner
                .subscriptions
                .entry(state.target.key.clone())
                .or_insert_with(|| Arc::clone(state))
                .value(),
        );
        if Arc::ptr_eq(&registered, state) {
            debug!(key = %state.target.key, "subscription reattached");
            let changes = self.clone();
            let state = Arc::clone(state);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = changes.ensure_watched(&state).await {
                            warn!(key = %state.target.key, error = %e, "failed to re-register subscription");
                            state.record_error(Arc::new(e));
                        }
                    });
                }
                // Replayed on the next connect.
                Err(_) => debug!(key = %state.target.key, "no runtime to send watch"),
            }
        }
        registered
    }

    /// Drop `state` from the registry if it is still the registered one
    /// and has no listeners.
    pub(crate) fn remove_state(&self, state: &Arc<SubscriptionState>) -> bool {
        self.inner
            .subscriptions
            .remove_if(&state.target.key, |_, s| {
                Arc::ptr_eq(s, state) && s.listener_count() == 0
            })
            .is_some()
    }

    /// Send `state`'s watch command on the current connection unless it
    /// is already watched there. Returns `false` if `state` was retired
    /// and is no longer registered.
    async fn ensure_watched(&self, state: &Arc<SubscriptionState>) -> Result<bool, CoreError> {
        let _command = state.command_lock.lock().await;
        if !self.is_registered(state) {
            return Ok(false);
        }
        self.watch_locked(state).await?;
        Ok(true)
    }

    /// No-op while disconnected; the connection loop replays every state
    /// on connect. Caller holds `state.command_lock`.
    async fn watch_locked(&self, state: &SubscriptionState) -> Result<(), CoreError> {
        if self.status() != ConnectionStatus::Connected {
            return Ok(());
        }
        let conn = self.inner.connection_id.load(Ordering::Acquire);
        if state.watched_on() == conn {
            return Ok(());
        }
        let target = &state.target;
        self.send(target.watch, target.param.as_deref(), target.params.as_deref())
            .await?;
        state.set_watched_on(conn);
        Ok(())
    }

    /// Unwatch `state` once its last listener is gone, then drop it from
    /// the registry. A listener that joins while the unwatch is in flight
    /// keeps the state and gets the watch sent again.
    pub(crate) async fn retire(&self, state: &Arc<SubscriptionState>) -> Result<(), CoreError> {
        let _command = state.command_lock.lock().await;
        if state.listener_count() > 0 || !self.is_registered(state) {
            return Ok(());
        }
        let result = self.unwatch_locked(state).await;
        if !self.remove_state(state) && self.is_registered(state) {
            self.watch_locked(state).await?;
        }
        result
    }

    /// Skipped while disconnected: the server forgot every watch when the
    /// socket dropped. Caller holds `state.command_lock`.
    async fn unwatch_locked(&self, state: &SubscriptionState) -> Result<(), CoreError> {
        let watched_on = state.watched_on();
        state.set_watched_on(0);
        let Some(command) = state.target.unwatch else {
            return Ok(());
        };
        let conn = self.inner.connection_id.load(Ordering::Acquire);
        if self.status() != ConnectionStatus::Connected || watched_on != conn {
            debug!(key = %state.target.key, "not watched on this connection, unwatch skipped");
            return Ok(());
        }
        let target = &state.target;
        self.send(command, target.param.as_deref(), target.params.as_deref())
            .await
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Write one control command and wait for the server to confirm it.
    pub(crate) async fn send(
        &self,
        command: &str,
        param: Option<&str>,
        params: Option<&[String]>,
    ) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::ChangesClosed);
        }

        let (command_id, confirmation) = {
            let mut writer = self.inner.writer.lock().await;
            let command_id = writer.next_command_id + 1;
            let Some(sink) = writer.sink.as_mut() else {
                return Err(CoreError::ChangesDisconnected {
                    message: "not connected".into(),
                });
            };
            let frame = ChangesCommandFrame {
                command_id,
                command,
                param,
                params,
            }
            .to_json()?;

            let (tx, rx) = oneshot::channel();
            self.inner.confirmations.insert(command_id, tx);
            debug!(command_id, command, "sending changes command");
            if let Err(e) = sink.send_text(frame).await {
                self.inner.confirmations.remove(&command_id);
                return Err(e.into());
            }
            writer.next_command_id = command_id;
            (command_id, rx)
        };

        let timeout = self.inner.config.confirmation_timeout;
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => {
                self.inner.confirmations.remove(&command_id);
                Err(CoreError::ChangesClosed)
            }
            result = tokio::time::timeout(timeout, confirmation) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(CoreError::ChangesDisconnected {
                    message: "connection dropped before confirmation".into(),
                }),
                Err(_) => {
                    self.inner.confirmations.remove(&command_id);
                    warn!(command_id, command, "changes command was not confirmed in time");
                    Err(CoreError::ConfirmationTimeout {
                        command_id,
                        command: command.to_owned(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            }
        }
    }

    /// Complete every pending confirmation with an error.
    fn fail_pending(&self, error: impl Fn() -> CoreError) {
        let ids: Vec<u64> = self.inner.confirmations.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.inner.confirmations.remove(&id) {
                let _ = tx.send(Err(error()));
            }
        }
    }

    fn notify_error(&self, error: CoreError) {
        let error = Arc::new(error);
        self.inner.last_error.store(Some(Arc::clone(&error)));
        for state in self.inner.subscriptions.iter() {
            state.record_error(Arc::clone(&error));
        }
        let _ = self.inner.errors.send(error);
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.inner.status.send_replace(status);
        if previous != status {
            debug!(database = %self.inner.database, from = %previous, to = %status, "change feed status");
        }
    }

    fn snapshot_states(&self) -> Vec<Arc<SubscriptionState>> {
        self.inner
            .subscriptions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Tear down local state once. Returns `false` if already closed.
    fn mark_closed(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.cancel.cancel();
        self.fail_pending(|| CoreError::ChangesClosed);
        self.inner.subscriptions.clear();

        let callback = self.inner.on_close.lock().ok().and_then(|mut slot| slot.take());
        if let Some(callback) = callback {
            callback();
        }
        self.set_status(ConnectionStatus::Closed);
        info!(database = %self.inner.database, "change feed closed");
        true
    }

    /// Stop reconnecting, fail pending sends, close the socket and drop
    /// every subscription. Safe to call more than once.
    pub async fn close(&self) {
        self.mark_closed();

        let sink = self.inner.writer.lock().await.sink.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "closing change feed socket failed");
            }
        }

        let handle = self.inner.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn require(what: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::InvalidArgument {
            message: format!("{what} cannot be blank"),
        });
    }
    Ok(())
}
