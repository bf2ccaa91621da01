//! Hetzner Cloud API request and response models.
//!
//! Based on the Hetzner Cloud API reference (<https://docs.hetzner.cloud>).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::providers::traits::{FirewallRule, Subnet};

// ============================================================================
// Common
// ============================================================================

/// Listing metadata.
#[derive(Debug, Default, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

/// Page cursor returned with every listing.
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub page: u32,
    #[serde(default)]
    pub next_page: Option<u32>,
}

/// Error envelope returned on failed requests.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: ApiError,
}

/// Error details.
#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

// ============================================================================
// Networks
// ============================================================================

/// Network as returned by the API.
#[derive(Debug, Deserialize)]
pub struct HcloudNetwork {
    pub id: u64,
    pub name: String,
    pub ip_range: String,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

/// `GET /networks`.
#[derive(Debug, Deserialize)]
pub struct NetworkListResponse {
    #[serde(default)]
    pub networks: Vec<HcloudNetwork>,
    #[serde(default)]
    pub meta: Meta,
}

/// `POST /networks` response.
#[derive(Debug, Deserialize)]
pub struct NetworkResponse {
    pub network: HcloudNetwork,
}

/// `POST /networks` body.
#[derive(Debug, Serialize)]
pub struct CreateNetworkBody<'a> {
    pub name: &'a str,
    pub ip_range: &'a str,
    pub subnets: &'a [Subnet],
}

// ============================================================================
// Firewalls
// ============================================================================

/// Firewall as returned by the API.
#[derive(Debug, Deserialize)]
pub struct HcloudFirewall {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

/// `GET /firewalls`.
#[derive(Debug, Deserialize)]
pub struct FirewallListResponse {
    #[serde(default)]
    pub firewalls: Vec<HcloudFirewall>,
    #[serde(default)]
    pub meta: Meta,
}

/// `POST /firewalls` response.
#[derive(Debug, Deserialize)]
pub struct FirewallResponse {
    pub firewall: HcloudFirewall,
}

/// Body carrying a firewall rule set.
#[derive(Debug, Serialize)]
pub struct FirewallRulesBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    pub rules: &'a [FirewallRule],
}

// ============================================================================
// SSH keys
// ============================================================================

/// SSH key as returned by the API.
#[derive(Debug, Deserialize)]
pub struct HcloudSshKey {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub fingerprint: String,
}

/// `GET /ssh_keys`.
#[derive(Debug, Deserialize)]
pub struct SshKeyListResponse {
    #[serde(default)]
    pub ssh_keys: Vec<HcloudSshKey>,
    #[serde(default)]
    pub meta: Meta,
}

/// `POST /ssh_keys` response.
#[derive(Debug, Deserialize)]
pub struct SshKeyResponse {
    pub ssh_key: HcloudSshKey,
}

/// `POST /ssh_keys` body.
#[derive(Debug, Serialize)]
pub struct CreateSshKeyBody<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
}

// ============================================================================
// Placement groups
// ============================================================================

/// Placement group as returned by the API.
#[derive(Debug, Deserialize)]
pub struct HcloudPlacementGroup {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub servers: Vec<u64>,
}

/// `GET /placement_groups`.
#[derive(Debug, Deserialize)]
pub struct PlacementGroupListResponse {
    #[serde(default)]
    pub placement_groups: Vec<HcloudPlacementGroup>,
    #[serde(default)]
    pub meta: Meta,
}

/// `POST /placement_groups` response.
#[derive(Debug, Deserialize)]
pub struct PlacementGroupResponse {
    pub placement_group: HcloudPlacementGroup,
}

/// `POST /placement_groups` body.
#[derive(Debug, Serialize)]
pub struct CreatePlacementGroupBody<'a> {
    pub name: &'a str,
    #[serde(rename = "type")]
    pub kind: &'a str,
}

// ============================================================================
// Load balancers
// ============================================================================

/// Public addresses of a load balancer or server.
#[derive(Debug, Default, Deserialize)]
pub struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4>,
}

/// IPv4 holder.
#[derive(Debug, Deserialize)]
pub struct Ipv4 {
    #[serde(default)]
    pub ip: Option<String>,
}

/// Label selector of a target.
#[derive(Debug, Serialize, Deserialize)]
pub struct LabelSelector {
    pub selector: String,
}

/// Server reference of a target.
#[derive(Debug, Deserialize)]
pub struct TargetServer {
    pub id: u64,
}

/// Load balancer target as returned by the API.
#[derive(Debug, Deserialize)]
pub struct HcloudTarget {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub server: Option<TargetServer>,
}

/// Load balancer as returned by the API.
#[derive(Debug, Deserialize)]
pub struct HcloudLoadBalancer {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub public_net: PublicNet,
    #[serde(default)]
    pub targets: Vec<HcloudTarget>,
}

/// `GET /load_balancers`.
#[derive(Debug, Deserialize)]
pub struct LoadBalancerListResponse {
    #[serde(default)]
    pub load_balancers: Vec<HcloudLoadBalancer>,
    #[serde(default)]
    pub meta: Meta,
}

/// `POST /load_balancers` response.
#[derive(Debug, Deserialize)]
pub struct LoadBalancerResponse {
    pub load_balancer: HcloudLoadBalancer,
}

/// Balancing algorithm.
#[derive(Debug, Serialize)]
pub struct Algorithm<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
}

/// TCP service definition.
#[derive(Debug, Serialize)]
pub struct LoadBalancerService<'a> {
    pub protocol: &'a str,
    pub listen_port: u16,
    pub destination_port: u16,
    pub proxyprotocol: bool,
}

/// Label-selector target body, used on create and `add_target`.
#[derive(Debug, Serialize)]
pub struct LabelSelectorTarget {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub label_selector: LabelSelector,
    pub use_private_ip: bool,
}

impl LabelSelectorTarget {
    pub fn new(selector: &str) -> Self {
        Self {
            kind: "label_selector",
            label_selector: LabelSelector {
                selector: selector.to_string(),
            },
            use_private_ip: true,
        }
    }
}

/// `POST /load_balancers` body.
#[derive(Debug, Serialize)]
pub struct CreateLoadBalancerBody<'a> {
    pub name: &'a str,
    pub load_balancer_type: &'a str,
    pub algorithm: Algorithm<'a>,
    pub location: &'a str,
    pub network: u64,
    pub public_interface: bool,
    pub services: Vec<LoadBalancerService<'a>>,
    pub targets: Vec<LabelSelectorTarget>,
}

// ============================================================================
// Servers
// ============================================================================

/// Private network attachment.
#[derive(Debug, Deserialize)]
pub struct PrivateNet {
    pub network: u64,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Server type reference.
#[derive(Debug, Deserialize)]
pub struct ServerTypeRef {
    pub name: String,
}

/// Datacenter reference.
#[derive(Debug, Deserialize)]
pub struct DatacenterRef {
    pub location: LocationRef,
}

/// Location reference.
#[derive(Debug, Deserialize)]
pub struct LocationRef {
    pub name: String,
}

/// Server as returned by the API.
#[derive(Debug, Deserialize)]
pub struct HcloudServer {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub public_net: PublicNet,
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
    pub server_type: ServerTypeRef,
    pub datacenter: DatacenterRef,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// `GET /servers`.
#[derive(Debug, Deserialize)]
pub struct ServerListResponse {
    #[serde(default)]
    pub servers: Vec<HcloudServer>,
    #[serde(default)]
    pub meta: Meta,
}

/// `POST /servers` response.
#[derive(Debug, Deserialize)]
pub struct ServerResponse {
    pub server: HcloudServer,
}

/// Firewall attachment on server creation.
#[derive(Debug, Serialize)]
pub struct FirewallRef {
    pub firewall: u64,
}

/// `POST /servers` body.
#[derive(Debug, Serialize)]
pub struct CreateServerBody<'a> {
    pub name: &'a str,
    pub server_type: &'a str,
    pub image: &'a str,
    pub location: &'a str,
    pub ssh_keys: Vec<u64>,
    pub networks: Vec<u64>,
    pub firewalls: Vec<FirewallRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_group: Option<u64>,
    pub labels: &'a BTreeMap<String, String>,
    pub user_data: &'a str,
    pub start_after_create: bool,
}

// ============================================================================
// Locations
// ============================================================================

/// Location as returned by the API.
#[derive(Debug, Deserialize)]
pub struct HcloudLocation {
    pub name: String,
    pub network_zone: String,
}

/// `GET /locations`.
#[derive(Debug, Deserialize)]
pub struct LocationListResponse {
    #[serde(default)]
    pub locations: Vec<HcloudLocation>,
    #[serde(default)]
    pub meta: Meta,
}

/// Listing responses that carry a page cursor.
pub trait Paged {
    /// Item type.
    type Item;

    /// Consume the page, returning its items and the next page number.
    fn into_page(self) -> (Vec<Self::Item>, Option<u32>);
}

macro_rules! paged {
    ($response:ty, $field:ident, $item:ty) => {
        impl Paged for $response {
            type Item = $item;

            fn into_page(self) -> (Vec<Self::Item>, Option<u32>) {
                let next = self.meta.pagination.and_then(|p| p.next_page);
                (self.$field, next)
            }
        }
    };
}

paged!(NetworkListResponse, networks, HcloudNetwork);
paged!(FirewallListResponse, firewalls, HcloudFirewall);
paged!(SshKeyListResponse, ssh_keys, HcloudSshKey);
paged!(PlacementGroupListResponse, placement_groups, HcloudPlacementGroup);
paged!(LoadBalancerListResponse, load_balancers, HcloudLoadBalancer);
paged!(ServerListResponse, servers, HcloudServer);
paged!(LocationListResponse, locations, HcloudLocation);
