#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ravenly_api::ReqwestTransport;
use ravenly_api::commands::{GetDocumentsCommand, PutCompareExchangeValueCommand};
use ravenly_core::{
    AggressiveCacheMode, AggressiveCacheOptions, CoreError, ExecuteOptions, ExecutorConfig,
    ExecutorEvent, JsonCommand, RequestExecutor,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn config(topology_updates: bool) -> ExecutorConfig {
    ExecutorConfig {
        request_timeout: Duration::from_millis(300),
        disable_topology_updates: !topology_updates,
        topology_refresh_interval: Duration::ZERO,
        cluster_write_poll_delay: Duration::from_millis(10),
        ..ExecutorConfig::default()
    }
}

fn executor(servers: &[&MockServer], config: ExecutorConfig) -> RequestExecutor {
    let urls: Vec<Url> = servers
        .iter()
        .map(|s| Url::parse(&s.uri()).unwrap())
        .collect();
    let transport = ReqwestTransport::with_client(reqwest::Client::new(), config.request_timeout);
    RequestExecutor::with_transport("db", &urls, config, Arc::new(transport)).unwrap()
}

fn topology_body(etag: i64, nodes: &[(&MockServer, &str)]) -> Value {
    json!({
        "Etag": etag,
        "Nodes": nodes
            .iter()
            .map(|(server, tag)| json!({
                "Url": server.uri(),
                "ClusterTag": tag,
                "Database": "db",
                "ServerRole": "Member",
            }))
            .collect::<Vec<_>>(),
    })
}

async fn requests_to(server: &MockServer) -> usize {
    server.received_requests().await.unwrap().len()
}

fn stats_command() -> JsonCommand<Value> {
    JsonCommand::get("stats")
}

// ── Failover ────────────────────────────────────────────────────────

#[tokio::test]
async fn timed_out_node_is_skipped_on_the_next_call() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/databases/db/stats"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&a)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "node": "b" })))
        .mount(&b)
        .await;

    let executor = executor(&[&a, &b, &c], config(false));
    let mut events = executor.subscribe_events();

    let first = executor.execute(&stats_command()).await.unwrap();
    assert_eq!(first, json!({ "node": "b" }));

    let topology = executor.topology();
    assert!(!executor.is_node_available(&topology.nodes[0]));
    assert!(executor.is_node_available(&topology.nodes[1]));

    let second = executor.execute(&stats_command()).await.unwrap();
    assert_eq!(second, json!({ "node": "b" }));

    assert_eq!(requests_to(&a).await, 1);
    assert_eq!(requests_to(&b).await, 2);
    assert_eq!(requests_to(&c).await, 0);

    let stats = executor.stats();
    assert_eq!(stats.failovers, 1);
    assert_eq!(stats.requests, 3);

    let mut failed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ExecutorEvent::FailedRequest { .. }) {
            failed += 1;
        }
    }
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn every_node_failing_is_all_nodes_unreachable() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    for server in [&a, &b] {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(server)
            .await;
    }

    let executor = executor(&[&a, &b], config(false));
    let err = executor.execute(&stats_command()).await.unwrap_err();
    assert!(matches!(err, CoreError::AllNodesUnreachable { attempted: 2, .. }), "{err}");

    let topology = executor.topology();
    assert!(topology.nodes.iter().all(|n| !executor.is_node_available(n)));
    // Still resolves to some node once every window is open again.
    assert!(executor.preferred_node().await.is_ok());
}

#[tokio::test]
async fn pinned_node_does_not_fail_over() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&a)
        .await;

    let executor = executor(&[&a, &b], config(false));
    let err = executor
        .execute_with(&stats_command(), &ExecuteOptions::on_node("?"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Api { status: Some(503), .. }), "{err}");
    assert_eq!(requests_to(&b).await, 0);

    let err = executor
        .execute_with(&stats_command(), &ExecuteOptions::on_node("Z"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RequestedNodeUnavailable { ref tag } if tag == "Z"));
}

// ── Error classification ────────────────────────────────────────────

#[tokio::test]
async fn client_errors_surface_immediately() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "Message": "conflict" })))
        .mount(&a)
        .await;

    let executor = executor(&[&a, &b], config(false));
    let err = executor.execute(&stats_command()).await.unwrap_err();
    assert!(
        matches!(err, CoreError::ClientError { status: 409, ref message } if message == "conflict"),
        "{err}"
    );
    assert_eq!(requests_to(&b).await, 0);
}

#[tokio::test]
async fn missing_database_is_fatal() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).insert_header("Database-Missing", "db"))
        .mount(&a)
        .await;

    let executor = executor(&[&a, &b], config(false));
    let err = executor.execute(&stats_command()).await.unwrap_err();
    assert!(matches!(err, CoreError::DatabaseDoesNotExist { ref database } if database == "db"));
    assert!(err.is_fatal());
    assert_eq!(requests_to(&b).await, 0);
}

#[tokio::test]
async fn non_idempotent_write_is_not_replayed() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&a)
        .await;

    let executor = executor(&[&a, &b], config(false));
    let command: JsonCommand<Value> = JsonCommand::put("docs", json!({ "Name": "x" }));
    let err = executor.execute(&command).await.unwrap_err();
    assert!(matches!(err, CoreError::Api { status: Some(500), .. }), "{err}");
    assert_eq!(requests_to(&b).await, 0);
}

#[tokio::test]
async fn overall_deadline_wins_over_failover() {
    let a = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&a)
        .await;

    let mut cfg = config(false);
    cfg.request_timeout = Duration::from_secs(5);
    let executor = executor(&[&a], cfg);

    let err = executor
        .execute_with(
            &stats_command(),
            &ExecuteOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout { timeout_ms: 100 }), "{err}");
}

// ── Caching ─────────────────────────────────────────────────────────

#[tokio::test]
async fn not_modified_serves_identical_cached_bytes() {
    let a = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/stats"))
        .and(header("If-None-Match", "\"7\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .mount(&a)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/stats"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"7\"")
                .set_body_json(json!({ "CountOfDocuments": 42 })),
        )
        .mount(&a)
        .await;

    let executor = executor(&[&a], config(false));
    let first = executor.execute(&stats_command()).await.unwrap();
    let second = executor.execute(&stats_command()).await.unwrap();
    assert_eq!(first, second);

    let cached = executor.cache().get("/databases/db/stats").unwrap();
    assert_eq!(cached.etag, "7");

    let stats = executor.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test]
async fn aggressive_scope_skips_the_network() {
    let a = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"1\"")
                .set_body_json(json!({ "v": 1 })),
        )
        .mount(&a)
        .await;

    let executor = executor(&[&a], config(false));
    executor.execute(&stats_command()).await.unwrap();

    {
        let _guard = executor.aggressively_cache_for(AggressiveCacheOptions::new(
            Duration::from_secs(300),
            AggressiveCacheMode::DoNotTrackChanges,
        ));
        let cached = executor.execute(&stats_command()).await.unwrap();
        assert_eq!(cached, json!({ "v": 1 }));
        assert_eq!(requests_to(&a).await, 1);

        // Nested scope turns it off again, then restores on drop.
        {
            let _off = executor.disable_aggressive_caching();
            assert!(executor.aggressive_caching().is_none());
        }
        assert!(executor.aggressive_caching().is_some());

        // An invalidation makes the entry ineligible until re-confirmed.
        executor.cache().bump_generation();
        executor.execute(&stats_command()).await.unwrap();
        assert_eq!(requests_to(&a).await, 2);
    }
    assert!(executor.aggressive_caching().is_none());
    assert_eq!(executor.stats().aggressive_cache_hits, 1);
}

#[tokio::test]
async fn missing_document_is_a_value_not_an_error() {
    let a = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/databases/db/docs"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&a)
        .await;

    let executor = executor(&[&a], config(false));
    let result = executor
        .execute(&GetDocumentsCommand::new(["users/404"]))
        .await
        .unwrap();
    assert!(result.is_none());
}

// ── Topology ────────────────────────────────────────────────────────

#[tokio::test]
async fn first_use_discovers_topology_and_force_refresh_honors_etag() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/topology"))
        .and(query_param("name", "db"))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(5, &[(&a, "A"), (&b, "B")])))
        .up_to_n_times(1)
        .mount(&a)
        .await;

    let executor = executor(&[&a], config(true));
    let mut events = executor.subscribe_events();

    let preferred = executor.preferred_node().await.unwrap();
    assert_eq!(preferred.cluster_tag, "A");
    let before = executor.topology();
    assert_eq!(before.etag, 5);
    assert_eq!(before.len(), 2);
    assert!(matches!(events.try_recv().unwrap(), ExecutorEvent::TopologyUpdated { .. }));

    // Stale etag: nothing is fetched, nothing changes.
    assert!(!executor.force_topology_refresh(3, None).await.unwrap());
    assert_eq!(requests_to(&a).await, 1);
    assert!(Arc::ptr_eq(&before, &executor.topology()));

    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(
            9,
            &[(&a, "A"), (&b, "B"), (&c, "C")],
        )))
        .mount(&a)
        .await;

    assert!(executor.force_topology_refresh(9, None).await.unwrap());
    let after = executor.topology();
    assert_eq!(after.etag, 9);
    assert_eq!(after.len(), 3);
    // The snapshot taken earlier is untouched.
    assert_eq!(before.len(), 2);
    assert_eq!(executor.stats().topology_updates, 2);
}

#[tokio::test]
async fn in_flight_call_keeps_its_topology_across_refresh() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(5, &[(&a, "A"), (&b, "B")])))
        .up_to_n_times(1)
        .mount(&a)
        .await;
    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(9, &[(&c, "C")])))
        .mount(&a)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/stats"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&a)
        .await;
    for (server, tag) in [(&b, "b"), (&c, "c")] {
        Mock::given(method("GET"))
            .and(path("/databases/db/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "node": tag })))
            .mount(server)
            .await;
    }

    let executor = executor(&[&a], config(true));
    let node_a = executor.preferred_node().await.unwrap();
    assert_eq!(executor.topology().etag, 5);

    let in_flight = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(&stats_command()).await }
    });
    // Let the call reach node A before the topology changes under it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(executor.force_topology_refresh(9, Some(node_a)).await.unwrap());
    assert_eq!(executor.topology().etag, 9);

    // Fails over within the snapshot it started with, never to C.
    let first = in_flight.await.unwrap().unwrap();
    assert_eq!(first, json!({ "node": "b" }));
    assert_eq!(requests_to(&c).await, 0);

    let next = executor.execute(&stats_command()).await.unwrap();
    assert_eq!(next, json!({ "node": "c" }));
    assert_eq!(requests_to(&b).await, 1);
    assert_eq!(requests_to(&c).await, 1);
}

#[tokio::test]
async fn unreachable_seeds_keep_the_seed_topology() {
    let a = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&a)
        .await;
    Mock::given(method("GET"))
        .and(path("/databases/db/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&a)
        .await;

    let mut cfg = config(true);
    cfg.node_backoff.initial = Duration::from_millis(1);
    let executor = executor(&[&a], cfg);
    executor.execute(&stats_command()).await.unwrap();
    assert_eq!(executor.topology().etag, -1);
}

#[tokio::test]
async fn topology_not_modified_keeps_snapshot() {
    let a = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/topology"))
        .and(header("If-None-Match", "\"5\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .mount(&a)
        .await;
    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(5, &[(&a, "A")])))
        .mount(&a)
        .await;

    let executor = executor(&[&a], config(true));
    let node = executor.preferred_node().await.unwrap();
    let changed = executor
        .update_topology(ravenly_core::UpdateTopologyParameters::new(node))
        .await
        .unwrap();
    assert!(!changed);
    assert_eq!(executor.topology().etag, 5);
}

// ── Cluster-wide writes ─────────────────────────────────────────────

#[tokio::test]
async fn unreplicated_cluster_write_follows_responsible_node() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(200).set_body_json(topology_body(2, &[(&a, "A"), (&b, "B")])))
        .mount(&a)
        .await;
    Mock::given(method("PUT"))
        .and(path("/databases/db/cmpxchg"))
        .respond_with(ResponseTemplate::new(404).insert_header("Raven-Responsible-Node", "B"))
        .mount(&a)
        .await;
    Mock::given(method("PUT"))
        .and(path("/databases/db/cmpxchg"))
        .and(query_param("key", "locks/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Raven-Server-Version", "5.4.110")
                .set_body_json(json!({
                    "Index": 11,
                    "Successful": true,
                    "Value": { "Object": "owner" },
                    "RaftCommandIndex": 11,
                })),
        )
        .mount(&b)
        .await;

    let executor = executor(&[&a], config(true));
    let command = PutCompareExchangeValueCommand::new("locks/1", json!("owner"), 0).unwrap();
    let result = executor.execute(&command).await.unwrap();

    assert!(result.successful);
    assert_eq!(result.raft_command_index, Some(11));
    assert_eq!(executor.last_raft_index(), Some(11));

    let sent = &b.received_requests().await.unwrap()[0];
    assert!(sent.url.query().unwrap().contains("raft-request-id="));
}

#[tokio::test]
async fn cluster_write_on_old_server_is_a_version_mismatch() {
    let a = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Raven-Server-Version", "5.1.3")
                .set_body_json(json!({ "Index": 1, "Successful": true })),
        )
        .mount(&a)
        .await;

    let executor = executor(&[&a], config(false));
    let command = PutCompareExchangeValueCommand::new("locks/1", json!(1), 0).unwrap();
    let err = executor.execute(&command).await.unwrap_err();
    assert!(
        matches!(err, CoreError::ClientVersionMismatch { ref server_version, .. } if server_version == "5.1.3"),
        "{err}"
    );

    // The version is remembered: the next attempt fails before sending.
    let err = executor.execute(&command).await.unwrap_err();
    assert!(matches!(err, CoreError::ClientVersionMismatch { .. }));
    assert_eq!(requests_to(&a).await, 1);
}
