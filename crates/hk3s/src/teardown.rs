//! Best-effort deletion of a cluster's resources.
//!
//! Order: load balancer, SSH key, servers, placement groups, network,
//! firewall. A short pause before the network and before the firewall
//! lets the provider release attachments. A failed deletion is logged and
//! recorded; the remaining deletions still run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::ClusterSpec;
use crate::naming;
use crate::providers::{CloudProvider, ProviderError, Server};

/// Outcome of a teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Resources that were deleted.
    pub deleted: Vec<String>,
    /// Resources that did not exist.
    pub missing: Vec<String>,
    /// Resources whose deletion failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl TeardownReport {
    /// Whether every deletion succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, resource: String, outcome: Result<bool, ProviderError>) {
        match outcome {
            Ok(true) => {
                info!(resource = %resource, "Deleted");
                self.deleted.push(resource);
            }
            Ok(false) => {
                debug!(resource = %resource, "Not found, nothing to delete");
                self.missing.push(resource);
            }
            Err(e) => {
                error!(resource = %resource, error = %e, "Deletion failed");
                self.failed.push((resource, e.to_string()));
            }
        }
    }
}

/// Delete what `get` finds; `Ok(false)` if it finds nothing.
async fn delete_found<T, G, F, D>(get: G, delete: F) -> Result<bool, ProviderError>
where
    G: Future<Output = Result<Option<T>, ProviderError>>,
    F: FnOnce(T) -> D,
    D: Future<Output = Result<(), ProviderError>>,
{
    match get.await? {
        Some(resource) => {
            delete(resource).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Deletes the resources of one cluster.
pub struct Teardown {
    spec: Arc<ClusterSpec>,
    provider: Arc<dyn CloudProvider>,
    pause: Duration,
}

impl Teardown {
    pub fn new(spec: Arc<ClusterSpec>, provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            spec,
            provider,
            pause: Duration::from_secs(1),
        }
    }

    /// Override the pause before the network and firewall deletions.
    #[must_use]
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Placement groups the cluster may own.
    fn placement_groups(&self) -> Vec<String> {
        let cluster = &self.spec.cluster_name;
        std::iter::once(naming::master_placement_group(cluster))
            .chain(
                self.spec
                    .worker_node_pools
                    .iter()
                    .map(|pool| naming::worker_placement_group(cluster, &pool.name)),
            )
            .collect()
    }

    /// Delete everything, continuing past failures.
    pub async fn run(&self, servers: &[Server]) -> TeardownReport {
        let provider = self.provider.as_ref();
        let cluster = self.spec.cluster_name.as_str();
        let mut report = TeardownReport::default();

        info!(cluster = %cluster, "Deleting cluster");

        let lb = naming::load_balancer_name(cluster);
        report.record(
            format!("load balancer {lb}"),
            delete_found(provider.get_load_balancer(&lb), |lb| {
                provider.delete_load_balancer(lb.id)
            })
            .await,
        );

        report.record(
            format!("ssh key {cluster}"),
            delete_found(provider.get_ssh_key(cluster), |key| {
                provider.delete_ssh_key(key.id)
            })
            .await,
        );

        for server in servers {
            report.record(
                format!("server {}", server.name),
                provider.delete_server(server.id).await.map(|()| true),
            );
        }

        for group in self.placement_groups() {
            report.record(
                format!("placement group {group}"),
                delete_found(provider.get_placement_group(&group), |pg| {
                    provider.delete_placement_group(pg.id)
                })
                .await,
            );
        }

        tokio::time::sleep(self.pause).await;

        if self.spec.uses_existing_network() {
            info!(network = %self.spec.network_name(), "Keeping existing network");
        } else {
            report.record(
                format!("network {cluster}"),
                delete_found(provider.get_network(cluster), |network| {
                    provider.delete_network(network.id)
                })
                .await,
            );
        }

        tokio::time::sleep(self.pause).await;

        report.record(
            format!("firewall {cluster}"),
            delete_found(provider.get_firewall(cluster), |firewall| {
                provider.delete_firewall(firewall.id)
            })
            .await,
        );

        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Cluster deleted"
        );
        report
    }
}
