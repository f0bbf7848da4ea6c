// ── Request executor ──
//
// Owns one database's view of the cluster: topology snapshot, node
// health, response cache and aggressive-cache scope. `execute` runs a
// `Command` against that state with conditional caching, failover
// across nodes, cluster-write redirects and lifecycle events.

mod aggressive;
mod events;
mod node_selector;
mod topology;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use reqwest::StatusCode;
use tokio::sync::{Mutex, OnceCell, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use ravenly_api::command::{
    DATABASE_MISSING_HEADER, IF_NONE_MATCH_HEADER, RAFT_REQUEST_ID_PARAM, REFRESH_TOPOLOGY_HEADER,
    RESPONSIBLE_NODE_HEADER, RawResponse, SERVER_VERSION_HEADER,
};
use ravenly_api::{Command, HttpTransport, ReqwestTransport, ServerNode, Topology};

use crate::cache::HttpCache;
use crate::config::{ExecutorConfig, StoreConfig, validate_database_name};
use crate::error::CoreError;

pub use aggressive::{
    AggressiveCacheGuard, AggressiveCacheMode, AggressiveCacheOptions, CacheScope,
};
pub use events::{ExecutorEvent, ExecutorStats, ExecutorStatsSnapshot};
pub use topology::UpdateTopologyParameters;

use aggressive::ScopeSlot;
use node_selector::NodeSelector;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Oldest server line that deduplicates cluster-wide writes by
/// `raft-request-id`.
const MIN_CLUSTER_WRITE_VERSION: (u32, u32) = (5, 2);

// ── ExecuteOptions ───────────────────────────────────────────────────

/// Per-call knobs for [`RequestExecutor::execute_with`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Pin the call to this cluster tag. No failover happens.
    pub node_tag: Option<String>,
    /// Overall deadline across every attempt.
    pub timeout: Option<Duration>,
    pub cache_scope: CacheScope,
}

impl ExecuteOptions {
    pub fn on_node(tag: impl Into<String>) -> Self {
        Self {
            node_tag: Some(tag.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_scope(mut self, scope: CacheScope) -> Self {
        self.cache_scope = scope;
        self
    }
}

/// Outcome of one attempt against one node.
enum Attempt<T> {
    Done(T),
    /// The node failed in a way another node may not.
    Failover(CoreError),
    /// A cluster-wide write is not visible here yet; `tag` owns it.
    Redirect { tag: String },
}

// ── RequestExecutor ──────────────────────────────────────────────────

/// Executes commands against one database of a cluster.
///
/// Cheaply cloneable via `Arc<ExecutorInner>`; safe to use from many
/// tasks at once. Call [`close`](Self::close) to stop the background
/// topology refresher.
#[derive(Clone)]
pub struct RequestExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    database: String,
    config: ExecutorConfig,
    seeds: Vec<ServerNode>,
    transport: Arc<dyn HttpTransport>,
    selector: NodeSelector,
    cache: HttpCache,
    aggressive: ScopeSlot,
    events: broadcast::Sender<ExecutorEvent>,
    stats: ExecutorStats,
    topology_lock: Mutex<()>,
    initialized: OnceCell<()>,
    server_versions: DashMap<String, String>,
    last_raft_index: AtomicU64,
    cancel: CancellationToken,
    refresher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("database", &self.inner.database)
            .field("topology_etag", &self.inner.selector.topology().etag)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    /// Build an executor with the production reqwest transport.
    ///
    /// URLs and TLS material are validated here, not at first request.
    pub fn new(database: &str, config: &StoreConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let transport = ReqwestTransport::new(&config.transport_config())?;
        Self::with_transport(
            database,
            &config.urls,
            config.executor.clone(),
            Arc::new(transport),
        )
    }

    /// Build an executor over any transport.
    pub fn with_transport(
        database: &str,
        urls: &[Url],
        config: ExecutorConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, CoreError> {
        validate_database_name(database)?;
        if urls.is_empty() {
            return Err(CoreError::Config {
                message: "at least one seed URL is required".into(),
            });
        }

        let seed_topology = Topology::from_seed_urls(urls, database);
        let seeds = seed_topology.nodes.clone();
        let selector =
            NodeSelector::new(seed_topology, config.read_balance, config.node_backoff.clone());
        let cache = HttpCache::new(&config.cache);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                database: database.to_owned(),
                config,
                seeds,
                transport,
                selector,
                cache,
                aggressive: ScopeSlot::default(),
                events,
                stats: ExecutorStats::default(),
                topology_lock: Mutex::new(()),
                initialized: OnceCell::new(),
                server_versions: DashMap::new(),
                last_raft_index: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                refresher: std::sync::Mutex::new(None),
            }),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Current topology snapshot. Never changes under the caller.
    pub fn topology(&self) -> Arc<Topology> {
        self.inner.selector.topology()
    }

    pub fn cache(&self) -> &HttpCache {
        &self.inner.cache
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.inner.events.subscribe()
    }

    /// Highest `RaftCommandIndex` returned by a cluster-wide write.
    pub fn last_raft_index(&self) -> Option<u64> {
        match self.inner.last_raft_index.load(Ordering::Acquire) {
            0 => None,
            index => Some(index),
        }
    }

    /// Version string the node reported in its last response.
    pub fn server_version(&self, node: &ServerNode) -> Option<String> {
        self.inner.server_versions.get(&node.url).map(|v| v.clone())
    }

    /// Whether `node` is outside its failure backoff window.
    pub fn is_node_available(&self, node: &ServerNode) -> bool {
        self.inner.selector.is_available(node)
    }

    /// The node new work goes to.
    pub async fn preferred_node(&self) -> Result<ServerNode, CoreError> {
        self.ensure_initialized().await?;
        self.inner
            .selector
            .preferred_node()
            .ok_or_else(|| self.unreachable(0, "topology has no nodes"))
    }

    pub async fn node_by_tag(&self, tag: &str) -> Result<ServerNode, CoreError> {
        self.ensure_initialized().await?;
        self.topology()
            .node_by_tag(tag)
            .map(|(_, node)| node.clone())
            .ok_or_else(|| CoreError::RequestedNodeUnavailable { tag: tag.to_owned() })
    }

    // ── Aggressive caching ───────────────────────────────────────────

    /// Serve cached reads up to `options.duration` old without a round
    /// trip until the guard drops.
    pub fn aggressively_cache_for(&self, options: AggressiveCacheOptions) -> AggressiveCacheGuard {
        AggressiveCacheGuard::enter(&self.inner.aggressive, Some(options))
    }

    /// Turn aggressive caching off until the guard drops.
    pub fn disable_aggressive_caching(&self) -> AggressiveCacheGuard {
        AggressiveCacheGuard::enter(&self.inner.aggressive, None)
    }

    pub fn aggressive_caching(&self) -> Option<AggressiveCacheOptions> {
        aggressive::resolve(&self.inner.aggressive, CacheScope::Inherit)
    }

    // ── Execution ────────────────────────────────────────────────────

    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, CoreError> {
        self.execute_with(command, &ExecuteOptions::default()).await
    }

    pub async fn execute_with<C: Command>(
        &self,
        command: &C,
        options: &ExecuteOptions,
    ) -> Result<C::Output, CoreError> {
        match options.timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.run(command, options))
                .await
                .map_err(|_| CoreError::timeout(deadline))?,
            None => self.run(command, options).await,
        }
    }

    async fn run<C: Command>(
        &self,
        command: &C,
        options: &ExecuteOptions,
    ) -> Result<C::Output, CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::Internal("request executor is closed".into()));
        }
        self.ensure_initialized().await?;

        let topology = self.inner.selector.topology();
        let candidates = match options.node_tag {
            Some(ref tag) => {
                let (idx, _) = topology
                    .node_by_tag(tag)
                    .ok_or_else(|| CoreError::RequestedNodeUnavailable { tag: tag.clone() })?;
                vec![idx]
            }
            None => self
                .inner
                .selector
                .candidates(&topology, command.is_read_request()),
        };
        let Some(first) = candidates.first().and_then(|&idx| topology.nodes.get(idx)) else {
            return Err(self.unreachable(0, "topology has no nodes"));
        };

        if command.is_read_request() {
            if let Some(output) = self.try_aggressive_cache(command, first, options.cache_scope)? {
                return Ok(output);
            }
        }

        let pinned = options.node_tag.is_some();
        let mut last_error: Option<CoreError> = None;
        let mut attempt: u32 = 0;

        for &idx in &candidates {
            let Some(node) = topology.nodes.get(idx) else {
                continue;
            };
            attempt += 1;

            let outcome = match self.attempt(command, node, attempt).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.emit_failure(node, &err);
                    return Err(err);
                }
            };

            match outcome {
                Attempt::Done(output) => {
                    self.inner.selector.record_success(node);
                    return Ok(output);
                }
                Attempt::Failover(err) => {
                    let backoff = self.inner.selector.mark_unavailable(node);
                    warn!(
                        database = %self.inner.database,
                        url = %node.url,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "node failed"
                    );
                    self.emit_failure(node, &err);
                    if pinned {
                        return Err(err);
                    }
                    if usize::try_from(attempt).is_ok_and(|n| n < candidates.len()) {
                        self.inner.stats.failover();
                    }
                    last_error = Some(err);
                }
                Attempt::Redirect { tag } => {
                    return self.follow_responsible_node(command, tag).await;
                }
            }
        }

        let last = last_error.map_or_else(|| "no node was tried".to_owned(), |e| e.to_string());
        Err(self.unreachable(candidates.len(), &last))
    }

    /// Serve a read from the cache without a round trip if the current
    /// scope allows it.
    fn try_aggressive_cache<C: Command>(
        &self,
        command: &C,
        node: &ServerNode,
        scope: CacheScope,
    ) -> Result<Option<C::Output>, CoreError> {
        let Some(options) = aggressive::resolve(&self.inner.aggressive, scope) else {
            return Ok(None);
        };
        let key = command.create_request(node)?.cache_key();
        let Some(entry) = self.inner.cache.get(&key) else {
            return Ok(None);
        };
        if !entry.is_fresh(options.duration, self.inner.cache.generation()) {
            return Ok(None);
        }

        self.inner.stats.aggressive_cache_hit();
        debug!(
            key,
            age_ms = u64::try_from(entry.age().as_millis()).unwrap_or(u64::MAX),
            "served from aggressive cache"
        );
        Ok(Some(command.parse_response(&entry.body, true)?))
    }

    async fn attempt<C: Command>(
        &self,
        command: &C,
        node: &ServerNode,
        attempt: u32,
    ) -> Result<Attempt<C::Output>, CoreError> {
        let mut request = command.create_request(node)?;
        let cache_key = request.cache_key();

        if let Some(raft_id) = command.raft_id() {
            self.check_cluster_write_support(node)?;
            request
                .url
                .query_pairs_mut()
                .append_pair(RAFT_REQUEST_ID_PARAM, raft_id);
        }

        let cached = if command.is_read_request() {
            self.inner.cache.get(&cache_key)
        } else {
            None
        };
        if let Some(ref entry) = cached {
            request = request.with_header(IF_NONE_MATCH_HEADER, &format!("\"{}\"", entry.etag))?;
        }

        let _ = self.inner.events.send(ExecutorEvent::BeforeRequest {
            database: self.inner.database.clone(),
            url: request.url.to_string(),
            command: command.name(),
            attempt,
        });
        self.inner.stats.request();
        debug!(command = command.name(), url = %request.url, attempt, "executing");

        let response = match self
            .inner
            .transport
            .send(request, Some(self.inner.config.request_timeout))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                // A refused connection never reached the server, so even a
                // non-idempotent write may go elsewhere.
                let replayable =
                    err.is_connect_failure() || (err.is_transient() && command.is_idempotent());
                let err = CoreError::from(err);
                return if replayable {
                    Ok(Attempt::Failover(err))
                } else {
                    Err(err)
                };
            }
        };

        self.observe_response(node, &response);
        let status = response.status;

        if status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached {
                self.inner.cache.mark_confirmed(&cache_key);
                self.inner.stats.cache_hit();
                self.emit_success(node, status, true);
                return Ok(Attempt::Done(command.parse_response(&entry.body, true)?));
            }
            if let Some(output) = command.parse_not_modified() {
                self.emit_success(node, status, false);
                return Ok(Attempt::Done(output));
            }
            return Err(CoreError::Api {
                message: "unexpected 304 Not Modified".into(),
                status: Some(304),
            });
        }

        if status.is_success() {
            if command.raft_id().is_some() {
                self.check_cluster_write_response(node, &response)?;
                self.track_raft_index(&response);
            }
            if command.is_read_request() {
                if let Some(etag) = response.etag() {
                    self.inner
                        .cache
                        .put(&cache_key, etag, response.body.clone());
                }
            }
            self.emit_success(node, status, false);
            return Ok(Attempt::Done(
                command.parse_response(&response.body, false)?,
            ));
        }

        let message = response.error_message();
        match status.as_u16() {
            404 => {
                if let Some(tag) = response.header_str(RESPONSIBLE_NODE_HEADER) {
                    return Ok(Attempt::Redirect {
                        tag: tag.to_owned(),
                    });
                }
                if command.is_read_request() {
                    self.inner.cache.invalidate(&cache_key);
                }
                match command.parse_not_found() {
                    Some(output) => {
                        self.emit_success(node, status, false);
                        Ok(Attempt::Done(output))
                    }
                    None => Err(CoreError::ClientError {
                        status: 404,
                        message,
                    }),
                }
            }
            401 | 403 => Err(CoreError::Authentication { message }),
            503 if response.header_str(DATABASE_MISSING_HEADER).is_some() => {
                Err(CoreError::DatabaseDoesNotExist {
                    database: self.inner.database.clone(),
                })
            }
            code @ 400..=499 => Err(CoreError::ClientError {
                status: code,
                message,
            }),
            code @ 500..=599 => {
                let err = CoreError::Api {
                    message,
                    status: Some(code),
                };
                if command.is_idempotent() {
                    Ok(Attempt::Failover(err))
                } else {
                    Err(err)
                }
            }
            code => Err(CoreError::Api {
                message,
                status: Some(code),
            }),
        }
    }

    /// Poll the node that owns a cluster-wide write until it is visible.
    async fn follow_responsible_node<C: Command>(
        &self,
        command: &C,
        mut tag: String,
    ) -> Result<C::Output, CoreError> {
        let limit = self.inner.config.max_cluster_write_redirects;
        let mut polls: u32 = 0;

        while polls < limit {
            polls += 1;
            tokio::time::sleep(self.inner.config.cluster_write_poll_delay).await;

            let topology = self.inner.selector.topology();
            let Some((_, node)) = topology.node_by_tag(&tag) else {
                debug!(tag, "responsible node not in topology, refreshing");
                if let Some(preferred) = self.inner.selector.preferred_node() {
                    let params = UpdateTopologyParameters::new(preferred)
                        .force()
                        .with_debug_tag("responsible-node-lookup");
                    if let Err(e) = self.update_topology(params).await {
                        debug!(error = %e, "topology refresh for redirect failed");
                    }
                }
                continue;
            };
            let node = node.clone();

            debug!(tag, poll = polls, url = %node.url, "polling responsible node for cluster write");
            match self.attempt(command, &node, polls).await {
                Ok(Attempt::Done(output)) => {
                    self.inner.selector.record_success(&node);
                    return Ok(output);
                }
                Ok(Attempt::Redirect { tag: next }) => tag = next,
                Ok(Attempt::Failover(err)) => {
                    self.inner.selector.mark_unavailable(&node);
                    self.emit_failure(&node, &err);
                    return Err(err);
                }
                Err(err) => {
                    self.emit_failure(&node, &err);
                    return Err(err);
                }
            }
        }

        Err(CoreError::ClusterWriteNotVisible {
            node_tag: tag,
            attempts: limit,
        })
    }

    // ── Failure feedback ─────────────────────────────────────────────

    /// Mark `node` as failed (used by the change feed when its socket
    /// drops) and return the node new work should go to instead.
    pub fn handle_unresponsive_node(
        &self,
        node: &ServerNode,
        error: &CoreError,
    ) -> Option<ServerNode> {
        let backoff = self.inner.selector.mark_unavailable(node);
        warn!(
            database = %self.inner.database,
            url = %node.url,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "node reported unresponsive"
        );
        self.emit_failure(node, error);
        self.inner.selector.preferred_node()
    }

    // ── Response bookkeeping ─────────────────────────────────────────

    fn observe_response(&self, node: &ServerNode, response: &RawResponse) {
        if let Some(version) = response.header_str(SERVER_VERSION_HEADER) {
            self.inner
                .server_versions
                .insert(node.url.clone(), version.to_owned());
        }

        let refresh = response
            .header_str(REFRESH_TOPOLOGY_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if refresh && !self.inner.config.disable_topology_updates {
            debug!(url = %node.url, "server requested topology refresh");
            let executor = self.clone();
            let params = UpdateTopologyParameters::new(node.clone())
                .with_timeout(Duration::ZERO)
                .with_debug_tag("refresh-topology-header");
            tokio::spawn(async move {
                if let Err(e) = executor.update_topology(params).await {
                    debug!(error = %e, "requested topology refresh failed");
                }
            });
        }
    }

    fn check_cluster_write_support(&self, node: &ServerNode) -> Result<(), CoreError> {
        match self.inner.server_versions.get(&node.url) {
            Some(version) if !supports_cluster_writes(&version) => {
                Err(version_mismatch(node, &version))
            }
            _ => Ok(()),
        }
    }

    fn check_cluster_write_response(
        &self,
        node: &ServerNode,
        response: &RawResponse,
    ) -> Result<(), CoreError> {
        match response.header_str(SERVER_VERSION_HEADER) {
            Some(version) if !supports_cluster_writes(version) => {
                Err(version_mismatch(node, version))
            }
            _ => Ok(()),
        }
    }

    fn track_raft_index(&self, response: &RawResponse) {
        let index = serde_json::from_slice::<serde_json::Value>(&response.body)
            .ok()
            .and_then(|v| v.get("RaftCommandIndex").and_then(serde_json::Value::as_u64));
        if let Some(index) = index {
            self.inner.last_raft_index.fetch_max(index, Ordering::AcqRel);
        }
    }

    // ── Events ───────────────────────────────────────────────────────

    fn emit_success(&self, node: &ServerNode, status: StatusCode, from_cache: bool) {
        let _ = self.inner.events.send(ExecutorEvent::SucceedRequest {
            database: self.inner.database.clone(),
            url: node.url.clone(),
            status: status.as_u16(),
            from_cache,
        });
    }

    fn emit_failure(&self, node: &ServerNode, error: &CoreError) {
        let _ = self.inner.events.send(ExecutorEvent::FailedRequest {
            database: self.inner.database.clone(),
            url: node.url.clone(),
            error: error.to_string(),
        });
    }

    fn unreachable(&self, attempted: usize, last_error: &str) -> CoreError {
        CoreError::AllNodesUnreachable {
            database: self.inner.database.clone(),
            attempted,
            last_error: last_error.to_owned(),
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop the background refresher. Further `execute` calls fail.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        if let Ok(mut slot) = self.inner.refresher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        debug!(database = %self.inner.database, "request executor closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

/// `major.minor` at or above [`MIN_CLUSTER_WRITE_VERSION`]. Unparseable
/// versions are given the benefit of the doubt.
fn supports_cluster_writes(version: &str) -> bool {
    let mut parts = version.split('.').map(str::parse::<u32>);
    match (parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor))) => (major, minor) >= MIN_CLUSTER_WRITE_VERSION,
        (Some(Ok(major)), None) => major > MIN_CLUSTER_WRITE_VERSION.0,
        _ => true,
    }
}

fn version_mismatch(node: &ServerNode, version: &str) -> CoreError {
    CoreError::ClientVersionMismatch {
        node: node.url.clone(),
        server_version: version.to_owned(),
        required: format!(
            "{}.{}",
            MIN_CLUSTER_WRITE_VERSION.0, MIN_CLUSTER_WRITE_VERSION.1
        ),
    }
}
