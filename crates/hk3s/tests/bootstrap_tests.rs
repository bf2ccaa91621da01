//! Bootstrap ordering and join token derivation against fakes.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{spec, Event, FakeExecutor, FakeProvider};
use hk3s::k3s::bootstrap::{TOKEN_COMMAND, TOKEN_LENGTH};
use hk3s::k3s::Bootstrapper;
use hk3s::kubeconfig::KUBECONFIG_COMMAND;
use hk3s::state::ClusterState;
use hk3s::Error;

const MASTERS: [&str; 3] = ["demo-cpx21-master1", "demo-cpx21-master2", "demo-cpx21-master3"];
const WORKERS: [&str; 2] = ["demo-cpx31-pool-small-worker1", "demo-cpx31-pool-small-worker2"];

/// Provider already holding three masters and two workers.
fn populated() -> Arc<FakeProvider> {
    let provider = FakeProvider::new();
    for (i, name) in MASTERS.iter().enumerate() {
        provider.insert_server(common::server(
            i as u64 + 1,
            name,
            &[("cluster", "demo"), ("role", "master")],
        ));
    }
    for (i, name) in WORKERS.iter().enumerate() {
        provider.insert_server(common::server(
            i as u64 + 11,
            name,
            &[("cluster", "demo"), ("role", "worker")],
        ));
    }
    provider
}

fn names_by_address(provider: &FakeProvider) -> HashMap<String, String> {
    provider
        .servers()
        .into_iter()
        .map(|s| (s.public_ipv4.unwrap(), s.name))
        .collect()
}

/// Install script events as `(index, server, is_start)`.
fn installs(executor: &FakeExecutor, names: &HashMap<String, String>) -> Vec<(usize, String, bool)> {
    executor
        .events()
        .into_iter()
        .enumerate()
        .filter_map(|(i, event)| {
            let (address, command, start) = match event {
                Event::Start { address, command } => (address, command, true),
                Event::End { address, command } => (address, command, false),
            };
            (command != TOKEN_COMMAND && command != KUBECONFIG_COMMAND)
                .then(|| (i, names[&address].clone(), start))
        })
        .collect()
}

#[tokio::test]
async fn test_bootstrap_runs_stages_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 3, &[("small", 2)]));
    let provider = populated();
    let executor = FakeExecutor::new();
    let state = Arc::new(ClusterState::new(spec.clone(), provider.clone()));

    Bootstrapper::new(state, executor.clone(), CancellationToken::new())
        .deploy()
        .await
        .unwrap();

    let events = installs(&executor, &names_by_address(&provider));
    let starts = |name: &str| -> Vec<usize> {
        events
            .iter()
            .filter(|(_, n, start)| n == name && *start)
            .map(|(i, _, _)| *i)
            .collect()
    };
    let end = |name: &str| -> usize {
        events
            .iter()
            .find(|(_, n, start)| n == name && !*start)
            .map(|(i, _, _)| *i)
            .unwrap()
    };

    // First master exactly once, before anything else is installed.
    assert_eq!(starts(MASTERS[0]).len(), 1);
    let first_done = end(MASTERS[0]);
    for name in MASTERS[1..].iter().chain(WORKERS.iter()).copied() {
        assert_eq!(starts(name).len(), 1, "{name} installed once");
        assert!(starts(name)[0] > first_done, "{name} started before the first master finished");
    }

    // Workers only once every master has finished.
    let masters_done = MASTERS.into_iter().map(end).max().unwrap();
    for name in WORKERS {
        assert!(starts(name)[0] > masters_done, "{name} started before the masters finished");
    }

    // Kubeconfig was fetched from the first master and points at the load balancer.
    let kubeconfig = std::fs::read_to_string(spec.kubeconfig_path()).unwrap();
    assert!(kubeconfig.contains("https://198.51.100.10:6443"));
    assert!(kubeconfig.contains("current-context: demo"));
}

#[tokio::test]
async fn test_first_master_failure_stops_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 3, &[("small", 2)]));
    let provider = populated();
    let executor = FakeExecutor::new();
    executor.fail_address("203.0.113.1");
    let state = Arc::new(ClusterState::new(spec.clone(), provider.clone()));

    let err = Bootstrapper::new(state, executor.clone(), CancellationToken::new())
        .deploy()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { ref address, .. } if address == "203.0.113.1"));

    // The token read also went to the failing address; nothing else was installed.
    let events = installs(&executor, &names_by_address(&provider));
    assert!(events.iter().all(|(_, name, _)| name == MASTERS[0]));
    assert!(!spec.kubeconfig_path().exists());
}

#[tokio::test]
async fn test_master_failure_keeps_workers_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 3, &[("small", 2)]));
    let provider = populated();
    let executor = FakeExecutor::new();
    executor.fail_address("203.0.113.3");
    let state = Arc::new(ClusterState::new(spec, provider.clone()));

    let err = Bootstrapper::new(state, executor.clone(), CancellationToken::new())
        .deploy()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { .. }));

    let events = installs(&executor, &names_by_address(&provider));
    assert!(events.iter().all(|(_, name, _)| !WORKERS.contains(&name.as_str())));
}

#[tokio::test]
async fn test_token_read_from_first_master() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 1, &[]));
    let provider = FakeProvider::new();
    provider.insert_server(common::server(1, MASTERS[0], &[("cluster", "demo")]));
    let executor = FakeExecutor::new().with_token_file("K10c0ffee::server:s3cr3t\n");
    let state = Arc::new(ClusterState::new(spec, provider));

    let bootstrapper = Bootstrapper::new(state, executor.clone(), CancellationToken::new());
    assert_eq!(bootstrapper.token().await.unwrap(), "s3cr3t");
    assert_eq!(bootstrapper.token().await.unwrap(), "s3cr3t");

    let reads = executor
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Start { command, .. } if command == TOKEN_COMMAND))
        .count();
    assert_eq!(reads, 1);
}

#[tokio::test]
async fn test_token_generated_when_first_master_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 1, &[]));
    let provider = FakeProvider::new();
    provider.insert_server(common::server(1, MASTERS[0], &[("cluster", "demo")]));
    let executor = FakeExecutor::new().unreachable_token();
    let state = Arc::new(ClusterState::new(spec, provider));

    let bootstrapper = Bootstrapper::new(state, executor, CancellationToken::new());
    let token = bootstrapper.token().await.unwrap();
    assert_eq!(token.len(), TOKEN_LENGTH);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(bootstrapper.token().await.unwrap(), token);
}

#[tokio::test]
async fn test_token_generated_for_new_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 1, &[]));
    let provider = FakeProvider::new();
    provider.insert_server(common::server(1, MASTERS[0], &[("cluster", "demo")]));
    let state = Arc::new(ClusterState::new(spec, provider));

    let token = Bootstrapper::new(state, FakeExecutor::new(), CancellationToken::new())
        .token()
        .await
        .unwrap();
    assert_eq!(token.len(), TOKEN_LENGTH);
}

#[tokio::test]
async fn test_worker_failure_aborts_without_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 3, &[("small", 2)]));
    let provider = populated();
    let executor = FakeExecutor::new();
    executor.fail_address("203.0.113.12");
    let state = Arc::new(ClusterState::new(spec.clone(), provider.clone()));

    let err = Bootstrapper::new(state, executor.clone(), CancellationToken::new())
        .deploy()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { ref address, .. } if address == "203.0.113.12"));

    // Masters stay installed and nothing is deleted.
    let events = installs(&executor, &names_by_address(&provider));
    for name in MASTERS {
        assert!(events.iter().any(|(_, n, start)| n == name && !*start));
    }
    assert!(spec.kubeconfig_path().exists());
    assert_eq!(provider.servers().len(), 5);
    assert_eq!(provider.calls("delete_server"), 0);
}

#[tokio::test]
async fn test_missing_private_addresses_are_read_again() {
    let dir = tempfile::tempdir().unwrap();
    let spec = Arc::new(spec(dir.path(), 3, &[("small", 2)]));
    let provider = populated();
    let state = Arc::new(ClusterState::new(spec, provider.clone()));
    let without_private = provider
        .servers()
        .into_iter()
        .map(|s| hk3s::providers::Server {
            private_ipv4: None,
            ..s
        })
        .collect();
    state.adopt_servers(without_private).await;

    Bootstrapper::new(state, FakeExecutor::new(), CancellationToken::new())
        .deploy()
        .await
        .unwrap();
    assert_eq!(provider.calls("get_server"), 5);
}
