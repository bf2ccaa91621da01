//! Cluster state for one run.
//!
//! Every handle is resolved explicitly through a `resolve_*` call and
//! then cached for the rest of the run. Cells are single-flight: when two
//! tasks resolve the same resource at once, one of them talks to the
//! provider and the other waits for its result.
//!
//! The load balancer is the one handle that may be fetched again, while
//! the provider has not yet assigned its public address.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::ClusterSpec;
use crate::error::{Error, Result};
use crate::naming::{self, Role};
use crate::providers::{
    CloudProvider, Firewall, LoadBalancer, Network, PlacementGroup, Server, SshKey,
};
use crate::reconcile::Reconciler;
use crate::retry::{with_retry_async, RetryConfig};

/// Label set by the cluster autoscaler on the nodes it creates.
const NODE_GROUP_LABEL: &str = "hcloud/node-group";

/// Whether `server` belongs to `cluster`: labelled `cluster=<name>`, or
/// created by the autoscaler for one of the cluster's pools.
#[must_use]
pub fn belongs_to_cluster(server: &Server, cluster: &str) -> bool {
    server.labels.get("cluster").is_some_and(|c| c == cluster)
        || server
            .labels
            .get(NODE_GROUP_LABEL)
            .is_some_and(|group| group.starts_with(cluster))
}

/// Servers of the cluster, sorted by name and split by role.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub all: Vec<Server>,
    pub masters: Vec<Server>,
    pub workers: Vec<Server>,
}

impl Inventory {
    /// Sort `servers` and classify them by name.
    #[must_use]
    pub fn new(mut servers: Vec<Server>) -> Self {
        servers.sort_by(|a, b| naming::sort_key(&a.name).cmp(&naming::sort_key(&b.name)));

        let by_role = |role| {
            servers
                .iter()
                .filter(|s| naming::classify(&s.name) == Some(role))
                .cloned()
                .collect::<Vec<_>>()
        };
        let masters = by_role(Role::Master);
        let workers = by_role(Role::Worker);

        Self {
            all: servers,
            masters,
            workers,
        }
    }

    /// First master, the one that initialized the cluster.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if there are no masters.
    pub fn first_master(&self) -> Result<&Server> {
        self.masters
            .first()
            .ok_or_else(|| Error::Config("cluster has no master servers".into()))
    }
}

/// Cached resource handles for one run.
pub struct ClusterState {
    spec: Arc<ClusterSpec>,
    provider: Arc<dyn CloudProvider>,
    reconciler: Reconciler,
    network: OnceCell<Network>,
    firewall: OnceCell<Firewall>,
    ssh_key: OnceCell<SshKey>,
    placement_groups: Mutex<HashMap<String, Arc<OnceCell<PlacementGroup>>>>,
    load_balancer: tokio::sync::Mutex<Option<LoadBalancer>>,
    inventory: OnceCell<Inventory>,
    token: OnceCell<String>,
    lb_address_retry: RetryConfig,
}

impl ClusterState {
    /// Empty state for `spec`.
    pub fn new(spec: Arc<ClusterSpec>, provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            reconciler: Reconciler::new(provider.clone(), spec.clone()),
            spec,
            provider,
            network: OnceCell::new(),
            firewall: OnceCell::new(),
            ssh_key: OnceCell::new(),
            placement_groups: Mutex::new(HashMap::new()),
            load_balancer: tokio::sync::Mutex::new(None),
            inventory: OnceCell::new(),
            token: OnceCell::new(),
            lb_address_retry: RetryConfig::fixed(10, Duration::from_secs(3)),
        }
    }

    /// Override how long to wait for the load balancer's public address.
    #[must_use]
    pub fn with_load_balancer_retry(mut self, retry: RetryConfig) -> Self {
        self.lb_address_retry = retry;
        self
    }

    /// Cluster configuration.
    #[must_use]
    pub fn spec(&self) -> &Arc<ClusterSpec> {
        &self.spec
    }

    /// Underlying provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }

    /// Reconciler bound to this cluster.
    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Resolve the private network.
    ///
    /// # Errors
    /// Returns an error if reconciliation fails.
    pub async fn resolve_network(&self) -> Result<&Network> {
        self.network
            .get_or_try_init(|| self.reconciler.network())
            .await
    }

    /// Resolve the firewall (requires the network's range).
    ///
    /// # Errors
    /// Returns an error if reconciliation fails.
    pub async fn resolve_firewall(&self) -> Result<&Firewall> {
        let network = self.resolve_network().await?;
        self.firewall
            .get_or_try_init(|| self.reconciler.firewall(network))
            .await
    }

    /// Resolve the SSH key, uploading the configured public key if needed.
    ///
    /// # Errors
    /// Returns an error if the key file cannot be read or reconciliation fails.
    pub async fn resolve_ssh_key(&self) -> Result<&SshKey> {
        self.ssh_key
            .get_or_try_init(|| async {
                let path = self.spec.public_key_path();
                let public_key = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    Error::Config(format!("cannot read public key {}: {e}", path.display()))
                })?;
                self.reconciler.ssh_key(&public_key).await
            })
            .await
    }

    /// Resolve placement group `name`.
    ///
    /// # Errors
    /// Returns an error if reconciliation fails.
    pub async fn resolve_placement_group(&self, name: &str) -> Result<PlacementGroup> {
        let cell = {
            let mut groups = self
                .placement_groups
                .lock()
                .map_err(|_| Error::Config("placement group cache poisoned".into()))?;
            groups.entry(name.to_string()).or_default().clone()
        };

        cell.get_or_try_init(|| self.reconciler.placement_group(name))
            .await
            .cloned()
    }

    /// Resolve the API load balancer.
    ///
    /// A cached handle without a public address is fetched again.
    ///
    /// # Errors
    /// Returns an error if reconciliation fails.
    pub async fn resolve_load_balancer(&self) -> Result<LoadBalancer> {
        let mut cached = self.load_balancer.lock().await;
        if let Some(lb) = cached.as_ref().filter(|lb| lb.public_ipv4.is_some()) {
            return Ok(lb.clone());
        }

        if cached.is_some() {
            debug!("Load balancer has no public address yet, fetching again");
        }
        let network = self.resolve_network().await?;
        let lb = self.reconciler.load_balancer(network).await?;
        *cached = Some(lb.clone());
        Ok(lb)
    }

    /// Public address of the load balancer, waiting for the provider to
    /// assign one.
    ///
    /// # Errors
    /// Returns an error if the address is still missing after the retries.
    pub async fn load_balancer_address(&self) -> Result<String> {
        let name = naming::load_balancer_name(&self.spec.cluster_name);
        with_retry_async(&self.lb_address_retry, "load balancer address", || async {
            self.resolve_load_balancer()
                .await?
                .public_ipv4
                .ok_or_else(|| {
                    Error::Config(format!("load balancer {name} has no public address yet"))
                })
        })
        .await
    }

    /// Adopt the servers produced by provisioning.
    ///
    /// Servers already resolved in this run are kept.
    pub async fn adopt_servers(&self, servers: Vec<Server>) -> &Inventory {
        self.inventory
            .get_or_init(|| async { Inventory::new(servers) })
            .await
    }

    /// Resolve the cluster's servers by listing the project.
    ///
    /// # Errors
    /// Returns an error if the listing fails.
    pub async fn resolve_servers(&self) -> Result<&Inventory> {
        self.inventory
            .get_or_try_init(|| async {
                let cluster = &self.spec.cluster_name;
                let servers = self
                    .provider
                    .list_servers()
                    .await
                    .map_err(|e| Error::provider("cannot list servers", e))?;
                let ours: Vec<_> = servers
                    .into_iter()
                    .filter(|s| belongs_to_cluster(s, cluster))
                    .collect();
                info!(cluster = %cluster, count = ours.len(), "Resolved cluster servers");
                Ok(Inventory::new(ours))
            })
            .await
    }

    /// Servers resolved so far, if any.
    #[must_use]
    pub fn inventory(&self) -> Option<&Inventory> {
        self.inventory.get()
    }

    /// Address the API is served on: the load balancer for several
    /// masters, the first master otherwise.
    ///
    /// # Errors
    /// Returns an error if the address cannot be determined.
    pub async fn api_address(&self) -> Result<String> {
        if self.spec.is_multi_master() {
            return self.load_balancer_address().await;
        }

        let inventory = self.resolve_servers().await?;
        let first = inventory.first_master()?;
        first
            .public_ipv4
            .clone()
            .ok_or_else(|| Error::Config(format!("server {} has no public address", first.name)))
    }

    /// Resolve the join token once per run.
    ///
    /// # Errors
    /// Returns whatever `derive` returns on failure.
    pub async fn resolve_token<F, Fut>(&self, derive: F) -> Result<&str>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.token
            .get_or_try_init(derive)
            .await
            .map(String::as_str)
    }
}
