// ── Topology maintenance ──
//
// First-time discovery over the seed URLs, on-demand updates (server
// hint, change-feed notification, explicit refresh) and the periodic
// background refresher. Updates are serialized by `topology_lock`; the
// snapshot itself is swapped atomically by the node selector.

use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ravenly_api::command::DATABASE_MISSING_HEADER;
use ravenly_api::commands::GetDatabaseTopologyCommand;
use ravenly_api::{Command, ServerNode};

use super::{ExecutorEvent, ExecutorInner, RequestExecutor};
use crate::error::CoreError;

/// Inputs to [`RequestExecutor::update_topology`].
#[derive(Debug, Clone)]
pub struct UpdateTopologyParameters {
    /// Node asked for the topology.
    pub node: ServerNode,
    /// How long to wait for a concurrent update to finish. `Some(ZERO)`
    /// skips the update when one is already running; `None` waits.
    pub timeout: Option<Duration>,
    /// Install the result even if its etag is not newer.
    pub force_update: bool,
    /// Label sent to the server for diagnostics.
    pub debug_tag: Option<String>,
}

impl UpdateTopologyParameters {
    pub fn new(node: ServerNode) -> Self {
        Self {
            node,
            timeout: None,
            force_update: false,
            debug_tag: None,
        }
    }

    pub fn force(mut self) -> Self {
        self.force_update = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_debug_tag(mut self, tag: impl Into<String>) -> Self {
        self.debug_tag = Some(tag.into());
        self
    }
}

impl RequestExecutor {
    /// Ask `params.node` for the current topology and install it if it
    /// is newer. Returns whether the snapshot changed.
    pub async fn update_topology(&self, params: UpdateTopologyParameters) -> Result<bool, CoreError> {
        if self.inner.config.disable_topology_updates || self.inner.cancel.is_cancelled() {
            return Ok(false);
        }

        let _guard = match params.timeout {
            Some(timeout) if timeout.is_zero() => match self.inner.topology_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(tag = ?params.debug_tag, "topology update already running, skipped");
                    return Ok(false);
                }
            },
            Some(timeout) => tokio::time::timeout(timeout, self.inner.topology_lock.lock())
                .await
                .map_err(|_| CoreError::timeout(timeout))?,
            None => self.inner.topology_lock.lock().await,
        };

        let current = self.inner.selector.topology();
        let known_etag = (!params.force_update).then_some(current.etag);
        let mut command = GetDatabaseTopologyCommand::new(known_etag);
        if let Some(ref tag) = params.debug_tag {
            command = command.with_debug_tag(tag.clone());
        }

        let target = ServerNode::new(params.node.url.clone(), self.inner.database.clone());
        let request = command.create_request(&target)?;
        debug!(url = %request.url, tag = ?params.debug_tag, "requesting topology");

        let response = self
            .inner
            .transport
            .send(request, Some(self.inner.config.request_timeout))
            .await?;

        let status = response.status;
        let topology = if status == StatusCode::NOT_MODIFIED {
            command.parse_not_modified().flatten()
        } else if status.is_success() {
            command.parse_response(&response.body, false)?
        } else if status == StatusCode::SERVICE_UNAVAILABLE
            && response.header_str(DATABASE_MISSING_HEADER).is_some()
        {
            return Err(CoreError::DatabaseDoesNotExist {
                database: self.inner.database.clone(),
            });
        } else {
            return Err(ravenly_api::Error::Http {
                status: status.as_u16(),
                message: response.error_message(),
            }
            .into());
        };

        let Some(topology) = topology else {
            return Ok(false);
        };
        let etag = topology.etag;
        let nodes = topology.len();
        if !self.inner.selector.on_update_topology(topology, params.force_update) {
            return Ok(false);
        }

        self.inner.stats.topology_update();
        info!(
            database = %self.inner.database,
            etag,
            nodes,
            source = %params.node.url,
            "topology updated"
        );
        let _ = self.inner.events.send(ExecutorEvent::TopologyUpdated {
            database: self.inner.database.clone(),
            topology: self.inner.selector.topology(),
        });
        Ok(true)
    }

    /// Refresh from `node` (or the preferred node) if the caller has seen
    /// an etag newer than the installed one.
    pub async fn force_topology_refresh(
        &self,
        etag: i64,
        node: Option<ServerNode>,
    ) -> Result<bool, CoreError> {
        if etag <= self.inner.selector.topology().etag {
            return Ok(false);
        }
        let Some(node) = node.or_else(|| self.inner.selector.preferred_node()) else {
            return Ok(false);
        };
        let params = UpdateTopologyParameters::new(node)
            .force()
            .with_debug_tag("force-refresh");
        self.update_topology(params).await
    }

    /// Run first-time discovery exactly once per executor.
    pub(crate) async fn ensure_initialized(&self) -> Result<(), CoreError> {
        self.inner
            .initialized
            .get_or_try_init(|| self.first_topology_update())
            .await
            .map(|_| ())
    }

    async fn first_topology_update(&self) -> Result<(), CoreError> {
        if self.inner.config.disable_topology_updates {
            debug!(database = %self.inner.database, "topology updates disabled, using seed URLs");
            return Ok(());
        }

        for seed in &self.inner.seeds {
            let params = UpdateTopologyParameters::new(seed.clone())
                .force()
                .with_debug_tag("first-topology-update");
            match self.update_topology(params).await {
                Ok(_) => {
                    self.start_refresher();
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(url = %seed.url, error = %e, "seed node did not return a topology");
                    self.inner.selector.mark_unavailable(seed);
                }
            }
        }

        warn!(
            database = %self.inner.database,
            seeds = self.inner.seeds.len(),
            "no seed returned a topology, continuing with seed URLs"
        );
        self.start_refresher();
        Ok(())
    }

    fn start_refresher(&self) {
        let period = self.inner.config.topology_refresh_interval;
        if period.is_zero() || self.inner.cancel.is_cancelled() {
            return;
        }
        let handle = tokio::spawn(refresh_task(
            Arc::downgrade(&self.inner),
            period,
            self.inner.cancel.clone(),
        ));
        if let Ok(mut slot) = self.inner.refresher.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }
}

/// Periodically re-fetch the topology from the preferred node. Holds
/// only a weak reference so dropping every executor handle ends it.
async fn refresh_task(inner: Weak<ExecutorInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let executor = RequestExecutor { inner };
                let Some(node) = executor.inner.selector.preferred_node() else { continue };
                let params = UpdateTopologyParameters::new(node)
                    .with_timeout(Duration::ZERO)
                    .with_debug_tag("timer");
                if let Err(e) = executor.update_topology(params).await {
                    warn!(error = %e, "periodic topology refresh failed");
                }
            }
        }
    }
}
