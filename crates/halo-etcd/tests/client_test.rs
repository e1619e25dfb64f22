//! Store client tests against mock etcd endpoints
//!
//! Each test runs one or more wiremock servers standing in for etcd members.
//! Unreachable members are closed localhost ports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use halo_etcd::{
    DeleteOptions, ErrorKind, EtcdClient, EtcdClientConfig, EtcdError, ReadOptions, SrvLookup,
    WriteOptions,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEAD_ENDPOINT: &str = "http://127.0.0.1:1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("halo_etcd=debug")
        .try_init();
}

fn leader_body(value: &str, index: u64) -> serde_json::Value {
    json!({
        "action": "get",
        "node": {"key": "/service/test/leader", "value": value,
                 "modifiedIndex": index, "createdIndex": index}
    })
}

fn members_body(client_url: &str) -> serde_json::Value {
    json!({
        "members": [{
            "id": "8e9e05c52164694d",
            "name": "default",
            "peerURLs": ["http://localhost:2380"],
            "clientURLs": [client_url]
        }]
    })
}

async fn mount_members(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(members_body(&server.uri())))
        .mount(server)
        .await;
}

fn static_config(hosts: Vec<String>) -> EtcdClientConfig {
    EtcdClientConfig::with_hosts(hosts).with_timeouts(500, 2000)
}

// ============== Failover ==============

#[tokio::test]
async fn test_read_fails_over_to_surviving_endpoint() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/service/test/leader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(leader_body("pg1", 10)))
        .expect(1)
        .mount(&server)
        .await;

    let client = EtcdClient::new_without_discovery(
        static_config(vec![server.uri()]),
        vec![DEAD_ENDPOINT.to_string(), server.uri()],
    )?;

    let result = client.get("/service/test/leader").await?;
    assert_eq!(result.value(), Some("pg1"));
    assert_eq!(client.base_uri(), Some(server.uri()));
    assert_eq!(client.machines(), vec![server.uri(), DEAD_ENDPOINT.to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_sticky_routing_prefers_last_good_endpoint() -> anyhow::Result<()> {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for server in [&first, &second] {
        Mock::given(method("GET"))
            .and(path("/v2/keys/service/test/leader"))
            .respond_with(ResponseTemplate::new(200).set_body_json(leader_body("pg1", 10)))
            .mount(server)
            .await;
    }

    let client = EtcdClient::new_without_discovery(
        static_config(Vec::new()),
        vec![first.uri(), second.uri()],
    )?;

    for _ in 0..3 {
        client.get("/service/test/leader").await?;
    }

    assert_eq!(first.received_requests().await.unwrap_or_default().len(), 3);
    assert!(second.received_requests().await.unwrap_or_default().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_malformed_response_fails_over() -> anyhow::Result<()> {
    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&broken)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/service/test/leader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(leader_body("pg2", 11)))
        .mount(&healthy)
        .await;

    let client = EtcdClient::new_without_discovery(
        static_config(Vec::new()),
        vec![broken.uri(), healthy.uri()],
    )?;

    let result = client.get("/service/test/leader").await?;
    assert_eq!(result.value(), Some("pg2"));
    assert_eq!(client.base_uri(), Some(healthy.uri()));
    Ok(())
}

#[tokio::test]
async fn test_exhausted_cache_is_reloaded_once() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    mount_members(&server).await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/service/test/leader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(leader_body("pg1", 10)))
        .mount(&server)
        .await;

    // The cache only knows a dead endpoint; the configured hosts know the live one.
    let client = EtcdClient::new_without_discovery(
        static_config(vec![server.uri()]),
        vec![DEAD_ENDPOINT.to_string()],
    )?;

    let result = client.get("/service/test/leader").await?;
    assert_eq!(result.value(), Some("pg1"));
    assert_eq!(client.machines(), vec![server.uri()]);
    Ok(())
}

#[tokio::test]
async fn test_all_endpoints_down_is_store_unreachable() -> anyhow::Result<()> {
    let client = EtcdClient::new_without_discovery(
        static_config(vec![DEAD_ENDPOINT.to_string()]),
        vec![DEAD_ENDPOINT.to_string(), "http://127.0.0.1:2".to_string()],
    )?;

    let err = client.get("/service/test/leader").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnreachable);
    Ok(())
}

// ============== Error mapping ==============

#[tokio::test]
async fn test_store_errors_are_typed() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/service/nocluster/"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errorCode": 100, "message": "Key not found",
            "cause": "/service/nocluster", "index": 42
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/service/exists/leader"))
        .respond_with(ResponseTemplate::new(412).set_body_json(json!({
            "errorCode": 105, "message": "Key already exists",
            "cause": "/service/exists/leader", "index": 42
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/service/stolen/leader"))
        .respond_with(ResponseTemplate::new(412).set_body_json(json!({
            "errorCode": 101, "message": "Compare failed",
            "cause": "[foo != bar]", "index": 42
        })))
        .mount(&server)
        .await;

    let client =
        EtcdClient::new_without_discovery(static_config(Vec::new()), vec![server.uri()])?;

    let err = client
        .read("/service/nocluster/", &ReadOptions::recursive())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);

    let err = client
        .write(
            "/service/exists/leader",
            "foo",
            &WriteOptions::new().with_prev_exist(false),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyAlreadyExists);

    let err = client
        .test_and_set("/service/stolen/leader", "foo", "foo", Some(30))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompareFailed);
    Ok(())
}

// ============== Request encoding ==============

#[tokio::test]
async fn test_conditional_write_sends_form_parameters() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/service/test/leader"))
        .and(body_string_contains("value=foo"))
        .and(body_string_contains("ttl=30"))
        .and(body_string_contains("prevValue=foo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action": "compareAndSwap",
            "node": {"key": "/service/test/leader", "value": "foo", "ttl": 30,
                     "modifiedIndex": 12, "createdIndex": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client =
        EtcdClient::new_without_discovery(static_config(Vec::new()), vec![server.uri()])?;

    let result = client
        .test_and_set("/service/test/leader", "foo", "foo", Some(30))
        .await?;
    assert_eq!(result.action, "compareAndSwap");
    assert_eq!(result.node.ttl, Some(30));
    Ok(())
}

#[tokio::test]
async fn test_delete_with_prev_value() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v2/keys/service/test/leader"))
        .and(query_param("prevValue", "foo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action": "compareAndDelete",
            "node": {"key": "/service/test/leader", "modifiedIndex": 13, "createdIndex": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client =
        EtcdClient::new_without_discovery(static_config(Vec::new()), vec![server.uri()])?;

    let options = DeleteOptions {
        prev_value: Some("foo".to_string()),
        ..Default::default()
    };
    let result = client.delete("/service/test/leader", &options).await?;
    assert_eq!(result.action, "compareAndDelete");
    Ok(())
}

#[tokio::test]
async fn test_etcd_index_header_is_recorded() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/service/test/leader"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Etcd-Index", "20800")
                .set_body_json(leader_body("pg1", 20728)),
        )
        .mount(&server)
        .await;

    let client =
        EtcdClient::new_without_discovery(static_config(Vec::new()), vec![server.uri()])?;

    let result = client.get("/service/test/leader").await?;
    assert_eq!(result.etcd_index, Some(20800));
    assert_eq!(result.modified_index(), 20728);
    Ok(())
}

// ============== Watch ==============

#[tokio::test]
async fn test_watch_returns_change() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/keys/service/test/leader"))
        .and(query_param("wait", "true"))
        .and(query_param("waitIndex", "20729"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action": "set",
            "node": {"key": "/service/test/leader", "value": "pg2",
                     "modifiedIndex": 20730, "createdIndex": 20730}
        })))
        .mount(&server)
        .await;

    let client =
        EtcdClient::new_without_discovery(static_config(Vec::new()), vec![server.uri()])?;

    let result = client
        .watch("/service/test/leader", Some(20729), Duration::from_secs(5), false)
        .await?;
    assert_eq!(result.value(), Some("pg2"));
    Ok(())
}

#[tokio::test]
async fn test_watch_timeout_is_operation_timed_out_without_failover() -> anyhow::Result<()> {
    let slow = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(leader_body("pg1", 10))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&slow)
        .await;

    let other = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(leader_body("pg1", 10)))
        .expect(0)
        .mount(&other)
        .await;

    let client = EtcdClient::new_without_discovery(
        static_config(Vec::new()),
        vec![slow.uri(), other.uri()],
    )?;

    let err = client
        .watch("/service/test/leader", Some(11), Duration::from_millis(300), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EtcdError::OperationTimedOut(_)));
    Ok(())
}

#[tokio::test]
async fn test_watch_timeout_does_not_promote_silent_endpoint() -> anyhow::Result<()> {
    let silent = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(leader_body("pg1", 10))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&silent)
        .await;

    let live = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(leader_body("pg1", 10)))
        .mount(&live)
        .await;

    let machines = vec![DEAD_ENDPOINT.to_string(), silent.uri(), live.uri()];
    let client =
        EtcdClient::new_without_discovery(static_config(Vec::new()), machines.clone())?;

    let err = client
        .watch("/service/test/leader", Some(11), Duration::from_millis(800), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EtcdError::OperationTimedOut(_)));
    assert_ne!(client.base_uri(), Some(silent.uri()));
    assert_eq!(client.machines(), machines);
    Ok(())
}

#[tokio::test]
async fn test_watch_failover_stays_within_window() -> anyhow::Result<()> {
    let failing = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(502)
                .set_body_string("<html>Bad Gateway</html>")
                .set_delay(Duration::from_millis(1200)),
        )
        .mount(&failing)
        .await;

    let polling = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(leader_body("pg2", 11))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&polling)
        .await;

    let client = EtcdClient::new_without_discovery(
        static_config(Vec::new()),
        vec![failing.uri(), polling.uri()],
    )?;

    let started = Instant::now();
    let err = client
        .watch("/service/test/leader", Some(11), Duration::from_millis(1500), false)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, EtcdError::OperationTimedOut(_)));
    assert!(elapsed < Duration::from_millis(1900), "watch took {:?}", elapsed);
    assert_eq!(
        polling.received_requests().await.unwrap_or_default().len(),
        1
    );
    Ok(())
}

// ============== Discovery ==============

#[tokio::test]
async fn test_new_discovers_from_static_hosts() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_members(&server).await;

    let client = EtcdClient::new(static_config(vec![
        DEAD_ENDPOINT.to_string(),
        server.uri(),
    ]))
    .await?;

    assert_eq!(client.machines(), vec![server.uri()]);
    Ok(())
}

#[tokio::test]
async fn test_new_fails_when_no_endpoint_answers() {
    let err = EtcdClient::new(static_config(vec![DEAD_ENDPOINT.to_string()]))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::EndpointDiscoveryFailed);
}

#[tokio::test]
async fn test_member_without_client_urls_is_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"members": [{}]})))
        .mount(&server)
        .await;

    let err = EtcdClient::new(static_config(vec![server.uri()]))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::EndpointDiscoveryFailed);
}

#[tokio::test]
async fn test_new_discovers_from_discovery_service() -> anyhow::Result<()> {
    let store = MockServer::start().await;
    mount_members(&store).await;
    let port = store.address().port();

    let discovery = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/exhibitor/v1/cluster/list"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"servers": ["127.0.0.1"], "port": port})),
        )
        .mount(&discovery)
        .await;

    let config = static_config(Vec::new())
        .with_discovery_url(&format!("{}/exhibitor/v1/cluster/list", discovery.uri()));
    let client = EtcdClient::new(config).await?;

    assert_eq!(client.machines(), vec![store.uri()]);
    Ok(())
}

#[tokio::test]
async fn test_discovery_service_failure_propagates() {
    let config = static_config(Vec::new())
        .with_discovery_url(&format!("{}/exhibitor/v1/cluster/list", DEAD_ENDPOINT));

    let err = EtcdClient::new(config).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::EndpointDiscoveryFailed);
}

struct FakeSrv {
    records: Vec<(String, u16)>,
}

#[async_trait]
impl SrvLookup for FakeSrv {
    async fn lookup_srv(&self, name: &str) -> halo_etcd::Result<Vec<(String, u16)>> {
        if name == "_etcd-server._tcp.test" {
            Ok(self.records.clone())
        } else {
            Err(EtcdError::EndpointDiscoveryFailed(format!("NXDOMAIN {}", name)))
        }
    }
}

#[tokio::test]
async fn test_new_discovers_from_srv_peers() -> anyhow::Result<()> {
    let store = MockServer::start().await;
    mount_members(&store).await;
    Mock::given(method("GET"))
        .and(path("/members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": 14855829450254237642u64,
            "name": "default",
            "peerURLs": ["http://localhost:2380"],
            "clientURLs": [store.uri()]
        }])))
        .mount(&store)
        .await;

    let srv = Arc::new(FakeSrv {
        records: vec![("127.0.0.1".to_string(), store.address().port())],
    });
    let config = static_config(Vec::new()).with_discovery_srv("test");
    let client = EtcdClient::new_with_srv_lookup(config, srv).await?;

    assert_eq!(client.machines(), vec![store.uri()]);
    Ok(())
}

#[tokio::test]
async fn test_empty_srv_falls_back_to_hosts() -> anyhow::Result<()> {
    let store = MockServer::start().await;
    mount_members(&store).await;

    let srv = Arc::new(FakeSrv {
        records: Vec::new(),
    });
    let config = static_config(vec![store.uri()]).with_discovery_srv("blabla");
    let client = EtcdClient::new_with_srv_lookup(config, srv).await?;

    assert_eq!(client.machines(), vec![store.uri()]);
    Ok(())
}
