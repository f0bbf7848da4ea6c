// ── Change feed connection loop ──
//
// Disconnected → Connecting → Connected → (error) → Disconnected → ...
// until close() cancels the token or the database turns out not to
// exist, which closes the feed for good.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info, warn};

use ravenly_api::changes::{ChangesMessage, Notification, parse_changes_frame};
use ravenly_api::websocket::changes_url;
use ravenly_api::{ServerNode, WebSocketSession, WebSocketSink};

use super::{ConnectionStatus, DatabaseChanges, TOPOLOGY_KEY, WatchTarget};
use crate::config::ReconnectConfig;
use crate::error::CoreError;
use crate::executor::UpdateTopologyParameters;

pub(super) async fn connection_loop(changes: DatabaseChanges) {
    let cancel = changes.inner.cancel.clone();
    let mut failures: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        changes.set_status(ConnectionStatus::Connecting);

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = connect_and_read(&changes, &mut failures) => outcome,
        };

        changes.on_disconnect().await;
        if cancel.is_cancelled() {
            break;
        }

        let error = outcome.err().unwrap_or_else(|| CoreError::ChangesDisconnected {
            message: "connection closed by server".into(),
        });

        if matches!(error, CoreError::DatabaseDoesNotExist { .. }) {
            warn!(database = %changes.inner.database, "database does not exist, change feed stopped");
            changes.notify_error(error);
            changes.mark_closed();
            break;
        }

        changes.set_status(ConnectionStatus::Disconnected);
        if let Some(node) = changes.inner.current_node.load_full() {
            changes.inner.executor.handle_unresponsive_node(&node, &error);
        }
        failures = failures.saturating_add(1);
        let delay = reconnect_delay(failures, &changes.inner.config.reconnect);
        info!(
            database = %changes.inner.database,
            error = %error,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "change feed disconnected, reconnecting"
        );
        changes.notify_error(error);

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    debug!(database = %changes.inner.database, "change feed loop exited");
}

/// Connect once and read until the socket fails. `Ok` means the server
/// ended the stream cleanly.
async fn connect_and_read(changes: &DatabaseChanges, failures: &mut u32) -> Result<(), CoreError> {
    let inner = &changes.inner;
    let node = match inner.node_tag {
        Some(ref tag) => inner.executor.node_by_tag(tag).await?,
        None => inner.executor.preferred_node().await?,
    };
    let url = changes_url(&node.url, &inner.database)?;
    inner.current_node.store(Some(Arc::new(node)));

    debug!(url = %url, "connecting change feed");
    let WebSocketSession { sink, mut source } = inner.connector.connect(&url).await?;

    let connection = changes.install_sink(sink).await;
    *failures = 0;
    changes.set_status(ConnectionStatus::Connected);
    info!(url = %url, connection, "change feed connected");

    // Replay needs confirmations, which only this loop reads.
    let replay = changes.clone();
    tokio::spawn(async move { replay.replay_subscriptions().await });

    loop {
        match source.next_text().await {
            Some(Ok(text)) => changes.process_frame(&text),
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        }
    }
}

/// `delay = min(initial * 2^(failures - 1), max)`
fn reconnect_delay(failures: u32, config: &ReconnectConfig) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    config
        .initial_delay
        .checked_mul(1u32 << exponent)
        .unwrap_or(config.max_delay)
        .min(config.max_delay.max(config.initial_delay))
}

impl DatabaseChanges {
    async fn install_sink(&self, sink: Box<dyn WebSocketSink>) -> u64 {
        let mut writer = self.inner.writer.lock().await;
        writer.sink = Some(sink);
        self.inner.connection_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    async fn on_disconnect(&self) {
        self.inner.writer.lock().await.sink = None;
        self.fail_pending(|| CoreError::ChangesDisconnected {
            message: "connection lost".into(),
        });
    }

    /// Re-send every registered watch command on the new connection.
    async fn replay_subscriptions(&self) {
        for state in self.snapshot_states() {
            if let Err(e) = self.ensure_watched(&state).await {
                warn!(key = %state.target.key, error = %e, "failed to re-register subscription");
                state.record_error(Arc::new(e));
            }
        }
    }

    fn process_frame(&self, text: &str) {
        let messages = match parse_changes_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "undecodable change feed frame");
                self.notify_error(CoreError::ChangeProcessing {
                    message: e.to_string(),
                });
                return;
            }
        };

        for message in messages {
            match message {
                ChangesMessage::SupportedFeatures(features) => {
                    let topology = features.topology_change;
                    self.inner.features.send_replace(Some(features));
                    if topology {
                        self.watch_topology();
                    }
                }
                ChangesMessage::Confirm { command_id } => {
                    match self.inner.confirmations.remove(&command_id) {
                        Some((_, tx)) => {
                            let _ = tx.send(Ok(()));
                        }
                        None => debug!(command_id, "confirmation for unknown command"),
                    }
                }
                ChangesMessage::Error { exception } => {
                    warn!(exception = %exception, "change feed server error");
                    self.fail_pending(|| CoreError::ChangeProcessing {
                        message: exception.clone(),
                    });
                    self.notify_error(CoreError::ChangeProcessing { message: exception });
                }
                ChangesMessage::Notification(notification) => self.dispatch(&notification),
                ChangesMessage::TopologyChange(change) => {
                    let node = ServerNode::new(change.url, change.database);
                    self.refresh_topology(node, "topology-change-notification");
                }
                ChangesMessage::Malformed { message_type, error } => {
                    warn!(message_type, error = %error, "malformed change feed message");
                    self.notify_error(CoreError::ChangeProcessing {
                        message: format!("cannot decode {message_type}: {error}"),
                    });
                }
                ChangesMessage::Unknown { message_type } => {
                    debug!(message_type, "ignoring unknown change feed message");
                }
            }
        }
    }

    fn dispatch(&self, notification: &Notification) {
        if matches!(notification, Notification::AggressiveCache(_)) {
            self.inner.executor.cache().bump_generation();
        }
        for state in self.snapshot_states() {
            state.dispatch(notification);
        }
    }

    /// The server can push topology changes: ask for them and catch up
    /// right away from the node we are connected to.
    fn watch_topology(&self) {
        let state = self.state_for(
            WatchTarget::new(TOPOLOGY_KEY, "watch-topology-change"),
            Arc::new(|_: &Notification| false),
        );
        let changes = self.clone();
        tokio::spawn(async move {
            if let Err(e) = changes.ensure_watched(&state).await {
                warn!(error = %e, "failed to watch topology changes");
            }
        });
        if let Some(node) = self.inner.current_node.load_full() {
            self.refresh_topology(ServerNode::clone(&node), "watch-topology-change");
        }
    }

    fn refresh_topology(&self, node: ServerNode, debug_tag: &'static str) {
        let executor = self.inner.executor.clone();
        let params = UpdateTopologyParameters::new(node)
            .force()
            .with_timeout(Duration::ZERO)
            .with_debug_tag(debug_tag);
        tokio::spawn(async move {
            if let Err(e) = executor.update_topology(params).await {
                debug!(error = %e, "topology refresh from change feed failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_is_fixed_by_default() {
        let config = ReconnectConfig::default();
        assert_eq!(reconnect_delay(1, &config), Duration::from_secs(1));
        assert_eq!(reconnect_delay(10, &config), Duration::from_secs(1));
    }

    #[test]
    fn reconnect_delay_escalates_when_allowed() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(reconnect_delay(1, &config), Duration::from_millis(500));
        assert_eq!(reconnect_delay(3, &config), Duration::from_secs(2));
        assert_eq!(reconnect_delay(9, &config), Duration::from_secs(4));
    }
}
