// ── Document store ──
//
// Entry point for applications: one request executor per database,
// created on first use, and one change feed per (database, node tag).
// Also wires aggressive caching to the change feed so cached reads are
// invalidated when the server says something changed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use ravenly_api::{
    Command, HttpTransport, ReqwestTransport, TungsteniteConnector, WebSocketConnector,
};

use crate::changes::{ChangesSubscription, DatabaseChanges};
use crate::config::StoreConfig;
use crate::error::CoreError;
use crate::executor::{
    AggressiveCacheGuard, AggressiveCacheMode, AggressiveCacheOptions, ExecuteOptions,
    RequestExecutor,
};

type FeedKey = (String, Option<String>);

/// Cluster client shared by an application.
///
/// Cheaply cloneable via `Arc<StoreInner>`.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    transport: Arc<dyn HttpTransport>,
    connector: Arc<dyn WebSocketConnector>,
    executors: DashMap<String, RequestExecutor>,
    feeds: Arc<DashMap<FeedKey, DatabaseChanges>>,
    /// Keeps `forAggressiveCaching` registered per database while any
    /// tracking scope is alive.
    cache_watches: DashMap<String, ChangesSubscription>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("urls", &self.inner.config.urls)
            .field("database", &self.inner.config.database)
            .field("executors", &self.inner.executors.len())
            .field("feeds", &self.inner.feeds.len())
            .finish_non_exhaustive()
    }
}

impl DocumentStore {
    /// Validate `config` and build the production HTTP and WebSocket
    /// transports. Bad URLs or unreadable TLS material fail here.
    pub fn new(config: StoreConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let transport_config = config.transport_config();
        let transport = ReqwestTransport::new(&transport_config)?;
        let connector =
            TungsteniteConnector::new(&transport_config, config.changes.connect_timeout)?;
        Ok(Self::with_transports(
            config,
            Arc::new(transport),
            Arc::new(connector),
        ))
    }

    /// Build a store over caller-supplied transports.
    pub fn with_transports(
        config: StoreConfig,
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn WebSocketConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                transport,
                connector,
                executors: DashMap::new(),
                feeds: Arc::new(DashMap::new()),
                cache_watches: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn database_name<'a>(&'a self, database: Option<&'a str>) -> Result<&'a str, CoreError> {
        database
            .or(self.inner.config.database.as_deref())
            .ok_or_else(|| CoreError::InvalidArgument {
                message: "no database given and the store has no default database".into(),
            })
    }

    // ── Executors ────────────────────────────────────────────────────

    /// The executor for `database` (or the default database).
    pub fn executor(&self, database: Option<&str>) -> Result<RequestExecutor, CoreError> {
        let name = self.database_name(database)?;
        if let Some(existing) = self.inner.executors.get(name) {
            return Ok(existing.clone());
        }

        let executor = RequestExecutor::with_transport(
            name,
            &self.inner.config.urls,
            self.inner.config.executor.clone(),
            Arc::clone(&self.inner.transport),
        )?;
        let executor = self
            .inner
            .executors
            .entry(name.to_owned())
            .or_insert(executor)
            .clone();
        debug!(database = name, "request executor ready");
        Ok(executor)
    }

    /// Run `command` against the default database.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, CoreError> {
        self.executor(None)?.execute(command).await
    }

    pub async fn execute_with<C: Command>(
        &self,
        database: Option<&str>,
        command: &C,
        options: &ExecuteOptions,
    ) -> Result<C::Output, CoreError> {
        self.executor(database)?.execute_with(command, options).await
    }

    // ── Change feeds ─────────────────────────────────────────────────

    /// The change feed for `database`, optionally pinned to a node tag.
    /// Reuses an open feed; a closed feed is replaced.
    pub fn changes(
        &self,
        database: Option<&str>,
        node_tag: Option<&str>,
    ) -> Result<DatabaseChanges, CoreError> {
        let name = self.database_name(database)?;
        let key: FeedKey = (name.to_owned(), node_tag.map(str::to_owned));

        if let Some(feed) = self.inner.feeds.get(&key) {
            if !feed.is_closed() {
                return Ok(feed.clone());
            }
        }

        let executor = self.executor(Some(name))?;
        let feed = self
            .inner
            .feeds
            .entry(key.clone())
            .and_modify(|existing| {
                if existing.is_closed() {
                    *existing = self.open_feed(&executor, &key);
                }
            })
            .or_insert_with(|| self.open_feed(&executor, &key))
            .clone();
        Ok(feed)
    }

    fn open_feed(&self, executor: &RequestExecutor, key: &FeedKey) -> DatabaseChanges {
        let feed = DatabaseChanges::new(
            executor.clone(),
            Arc::clone(&self.inner.connector),
            self.inner.config.changes.clone(),
            key.1.clone(),
        );

        info!(database = %key.0, node_tag = ?key.1, "change feed opened");

        // Forget the feed once it closes, unless it was already replaced.
        let feeds = Arc::downgrade(&self.inner.feeds);
        let close_key = key.clone();
        feed.set_on_close(move || {
            if let Some(feeds) = feeds.upgrade() {
                feeds.remove_if(&close_key, |_, f| f.is_closed());
            }
        });
        feed
    }

    // ── Aggressive caching ───────────────────────────────────────────

    /// Serve cached reads of `database` up to `duration` old without a
    /// round trip until the guard drops. With
    /// [`TrackChanges`](AggressiveCacheMode::TrackChanges) the database's
    /// change feed is opened so server-side changes invalidate the cache.
    pub async fn aggressively_cache_for(
        &self,
        duration: Duration,
        mode: AggressiveCacheMode,
        database: Option<&str>,
    ) -> Result<AggressiveCacheGuard, CoreError> {
        let name = self.database_name(database)?.to_owned();
        let executor = self.executor(Some(&name))?;

        if mode == AggressiveCacheMode::TrackChanges && !self.inner.cache_watches.contains_key(&name) {
            let feed = self.changes(Some(&name), None)?;
            let observable = feed.for_aggressive_caching().await?;
            // Cache invalidation happens in the feed itself; this listener
            // only keeps the watch registered.
            let subscription = observable.subscribe(|_| {});
            self.inner.cache_watches.entry(name.clone()).or_insert(subscription);
            debug!(database = %name, "aggressive cache tracks changes");
        }

        Ok(executor.aggressively_cache_for(AggressiveCacheOptions::new(duration, mode)))
    }

    /// Turn aggressive caching off for `database` until the guard drops.
    pub fn disable_aggressive_caching(
        &self,
        database: Option<&str>,
    ) -> Result<AggressiveCacheGuard, CoreError> {
        Ok(self.executor(database)?.disable_aggressive_caching())
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Close every change feed, then every executor.
    pub async fn close(&self) {
        self.inner.cache_watches.clear();

        let feeds: Vec<DatabaseChanges> =
            self.inner.feeds.iter().map(|f| f.value().clone()).collect();
        for feed in feeds {
            feed.close().await;
        }
        self.inner.feeds.clear();

        for executor in self.inner.executors.iter() {
            executor.close();
        }
        self.inner.executors.clear();
        info!("document store closed");
    }
}
