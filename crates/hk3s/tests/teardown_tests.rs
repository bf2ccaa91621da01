//! Best-effort teardown against a fake provider.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{spec, FakeProvider};
use hk3s::config::ClusterSpec;
use hk3s::state::ClusterState;
use hk3s::teardown::Teardown;

/// Create every shared resource of `spec` in `provider`.
async fn build(spec: &Arc<ClusterSpec>, provider: &Arc<FakeProvider>) -> Vec<hk3s::providers::Server> {
    let state = ClusterState::new(spec.clone(), provider.clone());
    state.resolve_firewall().await.unwrap();
    state.resolve_ssh_key().await.unwrap();
    state.resolve_placement_group("demo").await.unwrap();
    state.resolve_placement_group("demo-small").await.unwrap();
    state.resolve_load_balancer().await.unwrap();

    provider.insert_server(common::server(1, "demo-cpx21-master1", &[("cluster", "demo")]));
    provider.insert_server(common::server(2, "demo-cpx31-pool-small-worker1", &[("cluster", "demo")]));
    provider.servers()
}

#[tokio::test]
async fn test_teardown_deletes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 3, &[("small", 1)]));
    let provider = FakeProvider::new();
    let servers = build(&spec, &provider).await;

    let report = Teardown::new(spec, provider.clone())
        .with_pause(Duration::ZERO)
        .run(&servers)
        .await;

    assert!(report.is_clean(), "{:?}", report.failed);
    assert!(provider.servers().is_empty());
    assert!(!provider.has_network("demo"));
    assert!(provider.load_balancer("demo-api").is_none());
    assert_eq!(provider.calls("delete_placement_group"), 2);
    assert_eq!(provider.calls("delete_firewall"), 1);
    assert_eq!(provider.calls("delete_ssh_key"), 1);
}

#[tokio::test]
async fn test_network_failure_does_not_stop_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 3, &[("small", 1)]));
    let provider = FakeProvider::new();
    let servers = build(&spec, &provider).await;
    provider.fail("delete_network");

    let report = Teardown::new(spec, provider.clone())
        .with_pause(Duration::ZERO)
        .run(&servers)
        .await;

    assert!(!report.is_clean());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "network demo");
    assert_eq!(provider.calls("delete_firewall"), 1);
    assert!(report.deleted.contains(&"firewall demo".to_string()));
}

#[tokio::test]
async fn test_teardown_of_missing_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 1, &[]));
    let provider = FakeProvider::new();

    let report = Teardown::new(spec, provider.clone())
        .with_pause(Duration::ZERO)
        .run(&[])
        .await;

    assert!(report.is_clean());
    assert!(report.deleted.is_empty());
    assert_eq!(report.missing.len(), 5);
}

#[tokio::test]
async fn test_existing_network_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = spec(dir.path(), 1, &[]);
    spec.existing_network = Some("shared".to_string());
    let spec = Arc::new(spec);
    let provider = FakeProvider::new();
    provider.insert_network("shared", "10.50.0.0/16");

    let report = Teardown::new(spec, provider.clone())
        .with_pause(Duration::ZERO)
        .run(&[])
        .await;

    assert!(report.is_clean());
    assert!(provider.has_network("shared"));
    assert_eq!(provider.calls("delete_network"), 0);
    assert_eq!(provider.calls("get_network"), 0);
}
