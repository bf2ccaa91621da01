//! Resource reconciliation.
//!
//! Each method looks a resource up by name, brings a found resource's
//! mutable parts in line (subnet, firewall rules, load balancer target),
//! and creates it only when nothing matched. Calling any of them again
//! with the same input never creates a second resource.
//!
//! Provider errors are wrapped with the resource they concern and
//! returned; nothing here retries.

use std::sync::Arc;

use tracing::info;

use crate::config::ClusterSpec;
use crate::error::{Error, Result};
use crate::naming;
use crate::providers::{
    CloudProvider, CreateFirewallRequest, CreateLoadBalancerRequest, CreateNetworkRequest,
    CreateServerRequest, Firewall, FirewallRule, LoadBalancer, Network, PlacementGroup, Server,
    SshKey, Subnet,
};

/// Kubernetes API port.
pub const API_PORT: u16 = 6443;

/// Load balancer type used for the API.
const LOAD_BALANCER_TYPE: &str = "lb11";

/// Firewall rules for the cluster.
///
/// The API port is only opened directly for single-master clusters; with
/// several masters the API is reached through the load balancer.
#[must_use]
pub fn firewall_rules(spec: &ClusterSpec, network_range: &str) -> Vec<FirewallRule> {
    let mut rules = vec![
        FirewallRule::inbound(
            "icmp",
            None,
            vec!["0.0.0.0/0".to_string()],
            "Allow ICMP (ping)",
        ),
        FirewallRule::inbound(
            "tcp",
            Some("any"),
            vec![network_range.to_string()],
            "Allow all TCP traffic between nodes on the private network",
        ),
        FirewallRule::inbound(
            "udp",
            Some("any"),
            vec![network_range.to_string()],
            "Allow all UDP traffic between nodes on the private network",
        ),
    ];

    if !spec.is_multi_master() {
        let port = API_PORT.to_string();
        rules.extend(spec.api_allowed_networks.iter().map(|cidr| {
            FirewallRule::inbound(
                "tcp",
                Some(&port),
                vec![cidr.clone()],
                "Allow port 6443 (Kubernetes API server)",
            )
        }));
    }

    rules.extend(spec.ssh_allowed_networks.iter().map(|cidr| {
        FirewallRule::inbound("tcp", Some("22"), vec![cidr.clone()], "Allow port 22 (SSH)")
    }));

    rules
}

/// Get-or-create logic for every resource kind.
#[derive(Clone)]
pub struct Reconciler {
    provider: Arc<dyn CloudProvider>,
    spec: Arc<ClusterSpec>,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(provider: Arc<dyn CloudProvider>, spec: Arc<ClusterSpec>) -> Self {
        Self { provider, spec }
    }

    /// Private network, with a cloud subnet over its whole range.
    ///
    /// # Errors
    /// Returns an error if the provider fails, or if a configured
    /// `existing_network` does not exist.
    pub async fn network(&self) -> Result<Network> {
        let name = self.spec.network_name();
        let zone = self.spec.network_zone();

        let found = self
            .provider
            .get_network(name)
            .await
            .map_err(|e| Error::provider(format!("cannot get network {name}"), e))?;

        if let Some(network) = found {
            info!(network = %name, "Network exists");
            let subnet = Subnet::cloud(network.ip_range.clone(), zone);
            if !network.subnets.iter().any(|s| s.ip_range == subnet.ip_range) {
                info!(network = %name, range = %subnet.ip_range, zone, "Adding subnet");
                self.provider
                    .add_subnet(network.id, subnet)
                    .await
                    .map_err(|e| Error::provider(format!("cannot add subnet to {name}"), e))?;
            }
            return Ok(network);
        }

        if self.spec.uses_existing_network() {
            return Err(Error::Config(format!("existing network {name} not found")));
        }

        info!(network = %name, "Creating network");
        let range = self.spec.network_ip_range.clone();
        let network = self
            .provider
            .create_network(CreateNetworkRequest {
                name: name.to_string(),
                ip_range: range.clone(),
                subnets: vec![Subnet::cloud(range, zone)],
            })
            .await
            .map_err(|e| Error::provider(format!("cannot create network {name}"), e))?;
        info!(network = %name, "Network created");
        Ok(network)
    }

    /// Cluster firewall; rules of an existing firewall are replaced.
    ///
    /// # Errors
    /// Returns an error if the provider fails.
    pub async fn firewall(&self, network: &Network) -> Result<Firewall> {
        let name = self.spec.cluster_name.as_str();
        let rules = firewall_rules(&self.spec, &network.ip_range);

        let found = self
            .provider
            .get_firewall(name)
            .await
            .map_err(|e| Error::provider(format!("cannot get firewall {name}"), e))?;

        if let Some(mut firewall) = found {
            info!(firewall = %name, "Firewall exists, refreshing rules");
            self.provider
                .set_firewall_rules(firewall.id, rules.clone())
                .await
                .map_err(|e| Error::provider(format!("cannot set rules of firewall {name}"), e))?;
            firewall.rules = rules;
            return Ok(firewall);
        }

        info!(firewall = %name, "Creating firewall");
        self.provider
            .create_firewall(CreateFirewallRequest {
                name: name.to_string(),
                rules,
            })
            .await
            .map_err(|e| Error::provider(format!("cannot create firewall {name}"), e))
    }

    /// SSH key named after the cluster.
    ///
    /// # Errors
    /// Returns an error if the provider fails.
    pub async fn ssh_key(&self, public_key: &str) -> Result<SshKey> {
        let name = self.spec.cluster_name.as_str();

        let found = self
            .provider
            .get_ssh_key(name)
            .await
            .map_err(|e| Error::provider(format!("cannot get ssh key {name}"), e))?;

        if let Some(key) = found {
            info!(ssh_key = %name, "SSH public key exists");
            return Ok(key);
        }

        info!(ssh_key = %name, "Uploading SSH public key");
        self.provider
            .create_ssh_key(name, public_key.trim())
            .await
            .map_err(|e| Error::provider(format!("cannot create ssh key {name}"), e))
    }

    /// Spread placement group `name`.
    ///
    /// # Errors
    /// Returns an error if the provider fails.
    pub async fn placement_group(&self, name: &str) -> Result<PlacementGroup> {
        let found = self
            .provider
            .get_placement_group(name)
            .await
            .map_err(|e| Error::provider(format!("cannot get placement group {name}"), e))?;

        if let Some(group) = found {
            info!(placement_group = %name, "Placement group exists");
            return Ok(group);
        }

        info!(placement_group = %name, "Creating placement group");
        self.provider
            .create_placement_group(name)
            .await
            .map_err(|e| Error::provider(format!("cannot create placement group {name}"), e))
    }

    /// API load balancer targeting the masters by label.
    ///
    /// # Errors
    /// Returns an error if the provider fails.
    pub async fn load_balancer(&self, network: &Network) -> Result<LoadBalancer> {
        let cluster = self.spec.cluster_name.as_str();
        let name = naming::load_balancer_name(cluster);
        let selector = naming::master_selector(cluster);

        let found = self
            .provider
            .get_load_balancer(&name)
            .await
            .map_err(|e| Error::provider(format!("cannot get load balancer {name}"), e))?;

        if let Some(lb) = found {
            info!(load_balancer = %name, "Load balancer exists");
            if !lb.has_selector(&selector) {
                info!(load_balancer = %name, selector = %selector, "Adding label selector target");
                self.provider
                    .add_load_balancer_target(lb.id, &selector)
                    .await
                    .map_err(|e| {
                        Error::provider(
                            format!("cannot add label selector to load balancer {name}"),
                            e,
                        )
                    })?;
            }
            return Ok(lb);
        }

        info!(load_balancer = %name, "Creating load balancer");
        let lb = self
            .provider
            .create_load_balancer(CreateLoadBalancerRequest {
                name: name.clone(),
                load_balancer_type: LOAD_BALANCER_TYPE.to_string(),
                location: self.spec.location.clone(),
                network_id: network.id,
                port: API_PORT,
                label_selector: selector,
            })
            .await
            .map_err(|e| Error::provider(format!("cannot create load balancer {name}"), e))?;
        info!(load_balancer = %name, "Load balancer created");
        Ok(lb)
    }

    /// Server described by `req`.
    ///
    /// # Errors
    /// Returns an error if the provider fails.
    pub async fn server(&self, req: CreateServerRequest) -> Result<Server> {
        let name = req.name.clone();

        let found = self
            .provider
            .get_server(&name)
            .await
            .map_err(|e| Error::provider(format!("cannot get server {name}"), e))?;

        if let Some(server) = found {
            info!(server = %name, "Server exists");
            return Ok(server);
        }

        info!(server = %name, "Creating server");
        let server = self
            .provider
            .create_server(req)
            .await
            .map_err(|e| Error::provider(format!("cannot create server {name}"), e))?;
        info!(server = %name, "Server created");
        Ok(server)
    }

    /// Re-read a server whose create response lacked an address.
    ///
    /// # Errors
    /// Returns an error if the provider fails or the server vanished.
    pub async fn refresh_server(&self, server: Server) -> Result<Server> {
        if server.public_ipv4.is_some() && server.private_ipv4.is_some() {
            return Ok(server);
        }

        let name = server.name;
        self.provider
            .get_server(&name)
            .await
            .map_err(|e| Error::provider(format!("cannot get server {name}"), e))?
            .ok_or_else(|| {
                Error::provider(
                    format!("cannot get server {name}"),
                    crate::providers::ProviderError::NotFound(name.clone()),
                )
            })
    }
}
