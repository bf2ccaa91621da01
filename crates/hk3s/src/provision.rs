//! Concurrent provisioning of the cluster's servers.
//!
//! Creation runs one task per server, then readiness runs one task per
//! created server. Each phase is a barrier: readiness never starts before
//! every creation task has finished, and a failure in either phase fails
//! the whole run.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClusterSpec;
use crate::error::{Error, Result};
use crate::naming::{self, Role};
use crate::providers::{CreateServerRequest, Server};
use crate::readiness::await_ready;
use crate::retry::RetryConfig;
use crate::ssh::RemoteExecutor;
use crate::state::ClusterState;
use crate::tasks::{cancellable, join_all};
use crate::templates;

/// Most servers a single placement group can hold.
pub const PLACEMENT_GROUP_LIMIT: usize = 10;

/// Packages every node gets.
const BASE_PACKAGES: [&str; 2] = ["fail2ban", "wireguard"];

/// Desired server, before any handle is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    pub name: String,
    pub role: Role,
    pub instance_type: String,
    pub location: String,
    pub placement_group: String,
}

impl ServerDefinition {
    /// Labels identifying the server's cluster and role.
    #[must_use]
    pub fn labels(&self, cluster: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cluster".to_string(), cluster.to_string()),
            ("role".to_string(), self.role.as_label().to_string()),
        ])
    }
}

/// Every master and static worker the configuration asks for.
///
/// # Errors
/// Returns [`Error::Config`] if a pool does not fit in one placement group.
pub fn server_definitions(spec: &ClusterSpec) -> Result<Vec<ServerDefinition>> {
    let cluster = spec.cluster_name.as_str();
    let masters = &spec.masters;
    check_group_size("masters", masters.instance_count)?;

    let mut definitions: Vec<_> = (1..=masters.instance_count)
        .map(|i| ServerDefinition {
            name: naming::master_name(cluster, &masters.instance_type, i),
            role: Role::Master,
            instance_type: masters.instance_type.clone(),
            location: spec.location.clone(),
            placement_group: naming::master_placement_group(cluster),
        })
        .collect();

    for pool in &spec.worker_node_pools {
        check_group_size(&format!("worker pool {}", pool.name), pool.instance_count)?;
        let location = spec.pool_location(pool.location.as_deref()).to_string();
        definitions.extend((1..=pool.instance_count).map(|i| ServerDefinition {
            name: naming::worker_name(cluster, &pool.instance_type, &pool.name, i),
            role: Role::Worker,
            instance_type: pool.instance_type.clone(),
            location: location.clone(),
            placement_group: naming::worker_placement_group(cluster, &pool.name),
        }));
    }

    Ok(definitions)
}

fn check_group_size(pool: &str, count: usize) -> Result<()> {
    if count > PLACEMENT_GROUP_LIMIT {
        return Err(Error::Config(format!(
            "{pool} has {count} servers but a placement group holds at most {PLACEMENT_GROUP_LIMIT}"
        )));
    }
    Ok(())
}

/// Cloud-init document for a node.
///
/// With `join_script`, the script runs as the last command before the
/// reboot; the autoscaler uses this to join new nodes as workers.
///
/// # Errors
/// Returns an error if the template cannot be rendered.
pub fn cloud_init(spec: &ClusterSpec, join_script: Option<&str>) -> Result<String> {
    let packages: Vec<&str> = BASE_PACKAGES
        .iter()
        .copied()
        .chain(spec.additional_packages.iter().map(String::as_str))
        .collect();

    let mut commands: Vec<String> = [
        "crontab -l > /etc/cron_bkp",
        "echo '@reboot echo true > /etc/ready' >> /etc/cron_bkp",
        "crontab /etc/cron_bkp",
        "sed -i 's/[#]*PermitRootLogin yes/PermitRootLogin prohibit-password/g' /etc/ssh/sshd_config",
        "sed -i 's/[#]*PasswordAuthentication yes/PasswordAuthentication no/g' /etc/ssh/sshd_config",
        "systemctl restart sshd",
        "systemctl stop systemd-resolved",
        "systemctl disable systemd-resolved",
        "rm -f /etc/resolv.conf",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    for (i, nameserver) in spec.default_nameservers.iter().enumerate() {
        let redirect = if i == 0 { ">" } else { ">>" };
        commands.push(format!("echo 'nameserver {nameserver}' {redirect} /etc/resolv.conf"));
    }

    commands.extend(spec.post_create_commands.iter().cloned());

    if spec.fix_multipath {
        commands.push(
            r#"if ! grep -q blacklist /etc/multipath.conf; then printf 'blacklist {\n    devnode "^sd[a-z0-9]+"\n}' >> /etc/multipath.conf; fi"#
                .to_string(),
        );
        commands.push("systemctl restart multipathd.service".to_string());
    }

    // A join script must run before the node reboots.
    if let Some(script) = join_script {
        commands.push(format!("|\n    {}", script.trim_end().replace('\n', "\n    ")));
        commands.push("shutdown -r now".to_string());
    } else {
        let reboots = Regex::new(r"shutdown|[^@]reboot")
            .map_err(|e| Error::Config(format!("invalid reboot pattern: {e}")))?;
        if !reboots.is_match(&commands.join(" ")) {
            commands.push("shutdown -r now".to_string());
        }
    }

    templates::render(
        "cloud_init",
        templates::CLOUD_INIT,
        &json!({ "packages": packages, "commands": commands }),
    )
}

/// Creates the cluster's servers and waits until they can be bootstrapped.
pub struct Provisioner {
    state: Arc<ClusterState>,
    executor: Arc<dyn RemoteExecutor>,
    cancel: CancellationToken,
    readiness: RetryConfig,
}

impl Provisioner {
    pub fn new(
        state: Arc<ClusterState>,
        executor: Arc<dyn RemoteExecutor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            executor,
            cancel,
            readiness: RetryConfig::readiness(),
        }
    }

    /// Override the readiness polling policy.
    #[must_use]
    pub fn with_readiness_policy(mut self, policy: RetryConfig) -> Self {
        self.readiness = policy;
        self
    }

    /// Create (or find) every server, wait for all of them to be ready,
    /// and record them in the cluster state, sorted by name.
    ///
    /// With several masters the API load balancer is reconciled too.
    ///
    /// # Errors
    /// Returns the first creation or readiness failure.
    pub async fn provision(&self) -> Result<Vec<Server>> {
        let spec = self.state.spec().clone();
        let definitions = server_definitions(&spec)?;
        let user_data = Arc::new(cloud_init(&spec, None)?);

        // Shared handles first, so the creation tasks only read the cache.
        let network_id = self.state.resolve_network().await?.id;
        let firewall_id = self.state.resolve_firewall().await?.id;
        let ssh_key_id = self.state.resolve_ssh_key().await?.id;

        info!(count = definitions.len(), "Creating servers");
        let mut creations = JoinSet::new();
        for definition in definitions {
            let state = self.state.clone();
            let cancel = self.cancel.clone();
            let user_data = user_data.clone();
            let image = spec.image.clone();
            let cluster = spec.cluster_name.clone();

            creations.spawn(async move {
                cancellable(&cancel, async {
                    let group = state
                        .resolve_placement_group(&definition.placement_group)
                        .await?;
                    let request = CreateServerRequest {
                        name: definition.name.clone(),
                        server_type: definition.instance_type.clone(),
                        image,
                        location: definition.location.clone(),
                        ssh_key_id,
                        network_id,
                        firewall_id,
                        placement_group_id: Some(group.id),
                        labels: definition.labels(&cluster),
                        user_data: user_data.as_str().to_string(),
                    };
                    let reconciler = state.reconciler();
                    let server = reconciler.server(request).await?;
                    reconciler.refresh_server(server).await
                })
                .await
            });
        }
        let servers = join_all(creations).await?;

        info!(count = servers.len(), "Waiting for servers to be ready");
        let mut probes = JoinSet::new();
        for server in servers {
            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            let policy = self.readiness.clone();

            probes.spawn(async move {
                cancellable(&cancel, async {
                    await_ready(executor.as_ref(), &server, &policy).await?;
                    Ok(server)
                })
                .await
            });
        }
        let mut servers = join_all(probes).await?;
        servers.sort_by(|a, b| naming::sort_key(&a.name).cmp(&naming::sort_key(&b.name)));
        debug!(servers = ?servers.iter().map(|s| &s.name).collect::<Vec<_>>(), "Servers ready");

        if spec.is_multi_master() {
            self.state.resolve_load_balancer().await?;
        }

        self.state.adopt_servers(servers.clone()).await;
        Ok(servers)
    }
}
