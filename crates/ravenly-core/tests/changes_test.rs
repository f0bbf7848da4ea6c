#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

use ravenly_api::{
    Error, ReqwestTransport, WebSocketConnector, WebSocketSession, WebSocketSink, WebSocketSource,
};
use ravenly_core::{
    ChangesConfig, ConnectionStatus, CoreError, DatabaseChanges, ExecutorConfig, ReconnectConfig,
    RequestExecutor,
};

// ── In-memory WebSocket ─────────────────────────────────────────────

/// Server end of one in-memory connection.
struct ServerSide {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Result<String, Error>>,
}

impl ServerSide {
    /// Next raw command frame the client wrote.
    async fn next_frame(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("client sent nothing")
            .expect("client hung up")
    }

    async fn next_command(&mut self) -> Value {
        serde_json::from_str(&self.next_frame().await).unwrap()
    }

    async fn assert_silent(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(200), self.outbound.recv()).await;
        assert!(next.is_err(), "unexpected frame: {next:?}");
    }

    fn send(&self, frame: &Value) {
        self.inbound.send(Ok(frame.to_string())).unwrap();
    }

    fn confirm(&self, command: &Value) {
        self.send(&json!([{ "Type": "Confirm", "CommandId": command["CommandId"] }]));
    }
}

struct MemorySink(mpsc::UnboundedSender<String>);

#[async_trait]
impl WebSocketSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        self.0.send(text).map_err(|_| Error::WebSocketClosed {
            code: 1006,
            reason: "peer gone".into(),
        })
    }

    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

struct MemorySource(mpsc::UnboundedReceiver<Result<String, Error>>);

#[async_trait]
impl WebSocketSource for MemorySource {
    async fn next_text(&mut self) -> Option<Result<String, Error>> {
        self.0.recv().await
    }
}

struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerSide>,
    missing_database: bool,
    connects: AtomicUsize,
    urls: Mutex<Vec<Url>>,
}

#[async_trait]
impl WebSocketConnector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<WebSocketSession, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());
        if self.missing_database {
            return Err(Error::DatabaseDoesNotExist {
                database: "db".into(),
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerSide {
            outbound: out_rx,
            inbound: in_tx,
        });
        Ok(WebSocketSession {
            sink: Box::new(MemorySink(out_tx)),
            source: Box::new(MemorySource(in_rx)),
        })
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    changes: DatabaseChanges,
    executor: RequestExecutor,
    connector: Arc<MemoryConnector>,
    accepted: mpsc::UnboundedReceiver<ServerSide>,
}

impl Harness {
    fn start(confirmation_timeout: Duration, missing_database: bool) -> Self {
        let executor_config = ExecutorConfig {
            disable_topology_updates: true,
            topology_refresh_interval: Duration::ZERO,
            ..ExecutorConfig::default()
        };
        let transport = ReqwestTransport::with_client(reqwest::Client::new(), Duration::from_secs(1));
        let executor = RequestExecutor::with_transport(
            "db",
            &[Url::parse("http://node-a:8080").unwrap()],
            executor_config,
            Arc::new(transport),
        )
        .unwrap();

        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(MemoryConnector {
            accepted: accepted_tx,
            missing_database,
            connects: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        });
        let config = ChangesConfig {
            confirmation_timeout,
            connect_timeout: Duration::from_secs(1),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(50),
            },
        };
        let changes = DatabaseChanges::new(
            executor.clone(),
            Arc::clone(&connector) as Arc<dyn WebSocketConnector>,
            config,
            None,
        );
        Self {
            changes,
            executor,
            connector,
            accepted,
        }
    }

    async fn accept(&mut self) -> ServerSide {
        let server = tokio::time::timeout(Duration::from_secs(2), self.accepted.recv())
            .await
            .expect("client did not connect")
            .unwrap();
        self.changes.ensure_connected_now().await.unwrap();
        server
    }
}

fn doc_change(id: &str, collection: &str) -> Value {
    json!([{
        "Type": "DocumentChange",
        "Value": { "Type": "Put", "Id": id, "CollectionName": collection, "ChangeVector": "A:1" }
    }])
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn connects_to_the_changes_endpoint() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let _server = h.accept().await;
    assert_eq!(h.changes.status(), ConnectionStatus::Connected);
    assert_eq!(
        h.connector.urls.lock().unwrap()[0].as_str(),
        "ws://node-a:8080/databases/db/changes"
    );
    h.changes.close().await;
}

#[tokio::test]
async fn reconnect_replays_each_watch_once() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;

    let changes = h.changes.clone();
    let register = tokio::spawn(async move { changes.for_document("users/1").await });
    let command = server.next_command().await;
    assert_eq!(command["Command"], "watch-doc");
    assert_eq!(command["Param"], "users/1");
    server.confirm(&command);
    let observable = register.await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = observable.subscribe(move |change| {
        let _ = tx.send(change.id.clone());
    });

    // Server drops the socket.
    drop(server);
    let mut server = h.accept().await;

    let replayed = server.next_command().await;
    assert_eq!(replayed["Command"], "watch-doc");
    assert_eq!(replayed["Param"], "users/1");
    assert!(replayed["CommandId"].as_u64().unwrap() > command["CommandId"].as_u64().unwrap());
    server.confirm(&replayed);
    server.assert_silent().await;

    server.send(&doc_change("users/1", "Users"));
    let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, "users/1");
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);

    h.changes.close().await;
}

#[tokio::test]
async fn confirmations_resolve_out_of_order() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;

    let (a, b, c) = (h.changes.clone(), h.changes.clone(), h.changes.clone());
    let docs = tokio::spawn(async move { a.for_all_documents().await.map(|_| ()) });
    let index = tokio::spawn(async move { b.for_index("Orders/ByDate").await.map(|_| ()) });
    let ops = tokio::spawn(async move { c.for_all_operations().await.map(|_| ()) });

    let mut commands = Vec::new();
    for _ in 0..3 {
        commands.push(server.next_command().await);
    }
    let mut ids: Vec<u64> = commands
        .iter()
        .map(|c| c["CommandId"].as_u64().unwrap())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    for command in commands.iter().rev() {
        server.confirm(command);
    }

    tokio_test::assert_ok!(docs.await.unwrap());
    tokio_test::assert_ok!(index.await.unwrap());
    tokio_test::assert_ok!(ops.await.unwrap());
    h.changes.close().await;
}

#[tokio::test]
async fn error_frame_fails_pending_and_keeps_reading() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;
    let mut errors = h.changes.on_error();

    let changes = h.changes.clone();
    let pending = tokio::spawn(async move { changes.for_all_documents().await.map(|_| ()) });
    let _ = server.next_command().await;
    server.send(&json!([{ "Type": "Error", "Exception": "boom" }]));

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::ChangeProcessing { ref message } if message == "boom"), "{err}");
    let notified = errors.recv().await.unwrap();
    assert!(matches!(*notified, CoreError::ChangeProcessing { .. }));

    // Same socket, still alive.
    let changes = h.changes.clone();
    let next = tokio::spawn(async move { changes.for_index("Users/ByName").await.map(|_| ()) });
    let command = server.next_command().await;
    assert_eq!(command["Command"], "watch-index");
    server.confirm(&command);
    next.await.unwrap().unwrap();
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);

    h.changes.close().await;
}

#[tokio::test]
async fn notifications_reach_only_matching_subscriptions() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;

    let changes = h.changes.clone();
    let all_docs = tokio::spawn(async move { changes.for_all_documents().await });
    let command = server.next_command().await;
    server.confirm(&command);
    let all_docs = all_docs.await.unwrap().unwrap();

    let changes = h.changes.clone();
    let index = tokio::spawn(async move { changes.for_index("x").await });
    let command = server.next_command().await;
    server.confirm(&command);
    let index = index.await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _docs_sub = all_docs.subscribe(move |change| {
        let _ = tx.send(change.clone());
    });
    let index_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&index_hits);
    let _index_sub = index.subscribe(move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });

    server.send(&doc_change("orders/7", "Orders"));
    let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.id, "orders/7");
    assert_eq!(change.collection_name.as_deref(), Some("Orders"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(index_hits.load(Ordering::SeqCst), 0);

    h.changes.close().await;
}

#[tokio::test]
async fn unconfirmed_command_times_out_without_disconnecting() {
    let mut h = Harness::start(Duration::from_millis(100), false);
    let mut server = h.accept().await;

    let changes = h.changes.clone();
    let pending = tokio::spawn(async move { changes.for_all_documents().await.map(|_| ()) });
    let _ = server.next_command().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(
        matches!(err, CoreError::ConfirmationTimeout { ref command, timeout_ms: 100, .. } if command == "watch-docs"),
        "{err}"
    );
    assert_eq!(h.changes.status(), ConnectionStatus::Connected);
    h.changes.close().await;
}

#[tokio::test]
async fn missing_database_closes_the_feed() {
    let h = Harness::start(Duration::from_secs(2), true);

    let mut status = h.changes.connection_status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| *s == ConnectionStatus::Closed),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(
        h.changes.ensure_connected_now().await,
        Err(CoreError::ChangesClosed)
    ));
    assert!(matches!(
        h.changes.for_all_documents().await,
        Err(CoreError::ChangesClosed)
    ));
    assert!(matches!(
        h.changes.last_connection_state_error().as_deref(),
        Some(CoreError::DatabaseDoesNotExist { .. })
    ));

    // No reconnect attempts after a terminal error.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_unblocks_pending_send_and_is_idempotent() {
    let mut h = Harness::start(Duration::from_secs(10), false);
    let mut server = h.accept().await;

    let changes = h.changes.clone();
    let pending = tokio::spawn(async move { changes.for_all_documents().await.map(|_| ()) });
    let _ = server.next_command().await;

    h.changes.close().await;
    let err = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CoreError::ChangesClosed), "{err}");

    h.changes.close().await;
    assert_eq!(h.changes.status(), ConnectionStatus::Closed);
    assert!(h.changes.is_closed());
}

#[tokio::test]
async fn last_listener_sends_unwatch() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;

    let changes = h.changes.clone();
    let register = tokio::spawn(async move { changes.for_document("users/1").await });
    let command = server.next_command().await;
    server.confirm(&command);
    let observable = register.await.unwrap().unwrap();

    let first = observable.subscribe(|_| {});
    let second = observable.subscribe(|_| {});

    drop(first);
    server.assert_silent().await;

    let unsubscribe = tokio::spawn(second.unsubscribe());
    let frame = server.next_frame().await;
    insta::assert_snapshot!(frame, @r#"{"CommandId":2,"Command":"unwatch-doc","Param":"users/1"}"#);
    server.confirm(&serde_json::from_str(&frame).unwrap());
    tokio_test::assert_ok!(unsubscribe.await.unwrap());

    h.changes.close().await;
}

#[tokio::test]
async fn observable_subscribes_again_after_unwatch() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;

    let changes = h.changes.clone();
    let register = tokio::spawn(async move { changes.for_document("users/1").await });
    let command = server.next_command().await;
    server.confirm(&command);
    let observable = register.await.unwrap().unwrap();

    let unsubscribe = tokio::spawn(observable.subscribe(|_| {}).unsubscribe());
    let command = server.next_command().await;
    assert_eq!(command["Command"], "unwatch-doc");
    server.confirm(&command);
    tokio_test::assert_ok!(unsubscribe.await.unwrap());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = observable.subscribe(move |change| {
        let _ = tx.send(change.id.clone());
    });
    let command = server.next_command().await;
    assert_eq!(command["Command"], "watch-doc");
    assert_eq!(command["Param"], "users/1");
    server.confirm(&command);

    server.send(&doc_change("users/1", "Users"));
    let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, "users/1");

    h.changes.close().await;
}

#[tokio::test]
async fn watch_waits_for_pending_unwatch_of_same_target() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;

    let changes = h.changes.clone();
    let register = tokio::spawn(async move { changes.for_document("users/1").await });
    let command = server.next_command().await;
    server.confirm(&command);
    let observable = register.await.unwrap().unwrap();

    drop(observable.subscribe(|_| {}));
    let unwatch = server.next_command().await;
    assert_eq!(unwatch["Command"], "unwatch-doc");

    let changes = h.changes.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let again = tokio::spawn(async move {
        let observable = changes.for_document("users/1").await?;
        Ok::<_, CoreError>(observable.subscribe(move |change| {
            let _ = tx.send(change.id.clone());
        }))
    });

    // The new watch must not overtake the unwatch still in flight.
    server.assert_silent().await;
    server.confirm(&unwatch);

    let watch = server.next_command().await;
    assert_eq!(watch["Command"], "watch-doc");
    server.confirm(&watch);
    let _sub = again.await.unwrap().unwrap();
    server.assert_silent().await;

    server.send(&doc_change("users/1", "Users"));
    let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, "users/1");

    h.changes.close().await;
}

#[tokio::test]
async fn counter_of_document_sends_params_array() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;

    let changes = h.changes.clone();
    let register =
        tokio::spawn(async move { changes.for_counter_of_document("users/1", "likes").await });
    let frame = server.next_frame().await;
    insta::assert_snapshot!(
        frame,
        @r#"{"CommandId":1,"Command":"watch-document-counter","Param":null,"Params":["users/1","likes"]}"#
    );
    server.confirm(&serde_json::from_str(&frame).unwrap());
    let observable = register.await.unwrap().unwrap();
    assert_eq!(observable.key(), "document/users/1/counter/likes");

    assert!(matches!(
        h.changes.for_counter_of_document(" ", "likes").await,
        Err(CoreError::InvalidArgument { .. })
    ));
    h.changes.close().await;
}

#[tokio::test]
async fn feature_negotiation_and_cache_invalidation() {
    let mut h = Harness::start(Duration::from_secs(2), false);
    let mut server = h.accept().await;

    server.send(&json!([{ "TopologyChange": true, "ProtocolVersion": 2 }]));
    let command = server.next_command().await;
    assert_eq!(command["Command"], "watch-topology-change");
    assert_eq!(command["Param"], Value::Null);
    server.confirm(&command);

    let features = h.changes.supported_features().await.unwrap();
    assert!(features.topology_change);

    let generation = h.executor.cache().generation();
    server.send(&json!([{ "Type": "AggressiveCacheChange" }]));
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.executor.cache().generation() == generation {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Garbage is reported, not fatal.
    let mut errors = h.changes.on_error();
    server.inbound.send(Ok("{not json".into())).unwrap();
    let err = errors.recv().await.unwrap();
    assert!(matches!(*err, CoreError::ChangeProcessing { .. }));
    assert_eq!(h.changes.status(), ConnectionStatus::Connected);

    h.changes.close().await;
}
