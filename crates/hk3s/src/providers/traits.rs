//! Provider trait and common types for cloud resources.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Server is being created.
    Initializing,
    /// Server is booting.
    Starting,
    /// Server is on and running.
    Running,
    /// Server is shutting down.
    Stopping,
    /// Server is off.
    Off,
    /// Server is being deleted.
    Deleting,
    /// Server is being rebuilt.
    Rebuilding,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Off => write!(f, "off"),
            Self::Deleting => write!(f, "deleting"),
            Self::Rebuilding => write!(f, "rebuilding"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Subnet of a private network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Subnet range.
    pub ip_range: String,
    /// Network zone (e.g. `eu-central`).
    pub network_zone: String,
    /// Subnet type, always `cloud` for servers.
    #[serde(rename = "type")]
    pub kind: String,
}

impl Subnet {
    /// A cloud subnet in the given zone.
    #[must_use]
    pub fn cloud(ip_range: impl Into<String>, network_zone: impl Into<String>) -> Self {
        Self {
            ip_range: ip_range.into(),
            network_zone: network_zone.into(),
            kind: "cloud".to_string(),
        }
    }
}

/// A private network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub id: u64,
    pub name: String,
    pub ip_range: String,
    pub subnets: Vec<Subnet>,
}

/// A single inbound firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Always `in`.
    pub direction: String,
    /// `tcp`, `udp` or `icmp`.
    pub protocol: String,
    /// Port or range (`22`, `any`); absent for ICMP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Allowed sources.
    pub source_ips: Vec<String>,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FirewallRule {
    /// Inbound rule for `protocol` on `port` from `sources`.
    #[must_use]
    pub fn inbound(
        protocol: &str,
        port: Option<&str>,
        sources: Vec<String>,
        description: &str,
    ) -> Self {
        Self {
            direction: "in".to_string(),
            protocol: protocol.to_string(),
            port: port.map(str::to_string),
            source_ips: sources,
            description: Some(description.to_string()),
        }
    }
}

/// A firewall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firewall {
    pub id: u64,
    pub name: String,
    pub rules: Vec<FirewallRule>,
}

/// An uploaded SSH public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    pub fingerprint: String,
}

/// A spread placement group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementGroup {
    pub id: u64,
    pub name: String,
    /// Member server IDs.
    pub servers: Vec<u64>,
}

/// Load balancer target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadBalancerTarget {
    /// Backend membership by label match.
    LabelSelector(String),
    /// A single server.
    Server(u64),
    /// Anything else the API reports.
    Other,
}

/// A load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub id: u64,
    pub name: String,
    /// Public IPv4, absent until the provider assigns one.
    pub public_ipv4: Option<String>,
    pub targets: Vec<LoadBalancerTarget>,
}

impl LoadBalancer {
    /// Whether a label-selector target with `selector` already exists.
    #[must_use]
    pub fn has_selector(&self, selector: &str) -> bool {
        self.targets
            .iter()
            .any(|t| matches!(t, LoadBalancerTarget::LabelSelector(s) if s == selector))
    }
}

/// A cloud server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: ServerStatus,
    /// Public IPv4 address.
    pub public_ipv4: Option<String>,
    /// Address on the cluster network.
    pub private_ipv4: Option<String>,
    pub server_type: String,
    pub location: String,
    pub labels: BTreeMap<String, String>,
}

/// A datacenter location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub name: String,
    pub network_zone: String,
}

/// Request to create a network.
#[derive(Debug, Clone)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub ip_range: String,
    pub subnets: Vec<Subnet>,
}

/// Request to create a firewall.
#[derive(Debug, Clone)]
pub struct CreateFirewallRequest {
    pub name: String,
    pub rules: Vec<FirewallRule>,
}

/// Request to create a load balancer.
#[derive(Debug, Clone)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    /// Load balancer type (e.g. `lb11`).
    pub load_balancer_type: String,
    pub location: String,
    pub network_id: u64,
    /// Port served on both sides.
    pub port: u16,
    /// Label selector for the initial target.
    pub label_selector: String,
}

/// Request to create a server.
#[derive(Debug, Clone)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_key_id: u64,
    pub network_id: u64,
    pub firewall_id: u64,
    pub placement_group_id: Option<u64>,
    pub labels: BTreeMap<String, String>,
    /// Cloud-init document.
    pub user_data: String,
}

/// Trait for cloud resource providers.
///
/// `get_*` methods look resources up by name and return `Ok(None)` when
/// nothing matches. Listing methods page through every result.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Look up a network by name.
    async fn get_network(&self, name: &str) -> Result<Option<Network>, ProviderError>;

    /// Create a network.
    async fn create_network(&self, req: CreateNetworkRequest) -> Result<Network, ProviderError>;

    /// Add a subnet to an existing network.
    async fn add_subnet(&self, network_id: u64, subnet: Subnet) -> Result<(), ProviderError>;

    /// Delete a network.
    async fn delete_network(&self, id: u64) -> Result<(), ProviderError>;

    /// Look up a firewall by name.
    async fn get_firewall(&self, name: &str) -> Result<Option<Firewall>, ProviderError>;

    /// Create a firewall.
    async fn create_firewall(&self, req: CreateFirewallRequest)
        -> Result<Firewall, ProviderError>;

    /// Replace the rules of a firewall.
    async fn set_firewall_rules(
        &self,
        firewall_id: u64,
        rules: Vec<FirewallRule>,
    ) -> Result<(), ProviderError>;

    /// Delete a firewall.
    async fn delete_firewall(&self, id: u64) -> Result<(), ProviderError>;

    /// Look up an SSH key by name.
    async fn get_ssh_key(&self, name: &str) -> Result<Option<SshKey>, ProviderError>;

    /// Upload an SSH public key.
    async fn create_ssh_key(&self, name: &str, public_key: &str)
        -> Result<SshKey, ProviderError>;

    /// Delete an SSH key.
    async fn delete_ssh_key(&self, id: u64) -> Result<(), ProviderError>;

    /// Look up a placement group by name.
    async fn get_placement_group(&self, name: &str)
        -> Result<Option<PlacementGroup>, ProviderError>;

    /// Create a spread placement group.
    async fn create_placement_group(&self, name: &str) -> Result<PlacementGroup, ProviderError>;

    /// Delete a placement group.
    async fn delete_placement_group(&self, id: u64) -> Result<(), ProviderError>;

    /// Look up a load balancer by name.
    async fn get_load_balancer(&self, name: &str)
        -> Result<Option<LoadBalancer>, ProviderError>;

    /// Create a load balancer.
    async fn create_load_balancer(
        &self,
        req: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer, ProviderError>;

    /// Add a label-selector target routed over private IPs.
    async fn add_load_balancer_target(
        &self,
        load_balancer_id: u64,
        selector: &str,
    ) -> Result<(), ProviderError>;

    /// Delete a load balancer.
    async fn delete_load_balancer(&self, id: u64) -> Result<(), ProviderError>;

    /// Look up a server by name.
    async fn get_server(&self, name: &str) -> Result<Option<Server>, ProviderError>;

    /// Create a server.
    async fn create_server(&self, req: CreateServerRequest) -> Result<Server, ProviderError>;

    /// Delete a server.
    async fn delete_server(&self, id: u64) -> Result<(), ProviderError>;

    /// List every server in the project.
    async fn list_servers(&self) -> Result<Vec<Server>, ProviderError>;

    /// List every location.
    async fn list_locations(&self) -> Result<Vec<Location>, ProviderError>;
}
