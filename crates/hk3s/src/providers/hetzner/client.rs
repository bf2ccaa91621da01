//! Hetzner Cloud API client implementation.
//!
//! API Documentation: <https://docs.hetzner.cloud>

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    Algorithm, CreateLoadBalancerBody, CreateNetworkBody, CreatePlacementGroupBody,
    CreateServerBody, CreateSshKeyBody, ErrorResponse, FirewallListResponse, FirewallRef,
    FirewallResponse, FirewallRulesBody, HcloudFirewall, HcloudLoadBalancer, HcloudNetwork,
    HcloudPlacementGroup, HcloudServer, HcloudSshKey, LabelSelectorTarget,
    LoadBalancerListResponse, LoadBalancerResponse, LoadBalancerService, LocationListResponse,
    NetworkListResponse, NetworkResponse, Paged, PlacementGroupListResponse,
    PlacementGroupResponse, ServerListResponse, ServerResponse, SshKeyListResponse,
    SshKeyResponse,
};
use crate::providers::traits::{
    CloudProvider, CreateFirewallRequest, CreateLoadBalancerRequest, CreateNetworkRequest,
    CreateServerRequest, Firewall, FirewallRule, LoadBalancer, LoadBalancerTarget, Location,
    Network, PlacementGroup, ProviderError, Server, ServerStatus, SshKey, Subnet,
};

/// Base URL for Hetzner Cloud API.
const API_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Page size for listings.
const PER_PAGE: u32 = 50;

/// Hetzner Cloud provider.
#[derive(Clone)]
pub struct HetznerCloud {
    /// HTTP client.
    client: Client,
    /// API token.
    token: String,
    /// API base URL.
    base_url: String,
}

impl HetznerCloud {
    /// Create a new Hetzner Cloud provider.
    ///
    /// # Errors
    /// Returns error if the token is empty or the HTTP client cannot be created.
    pub fn new(token: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(token, API_BASE_URL)
    }

    /// Create a provider against a different API endpoint.
    ///
    /// # Errors
    /// Returns error if the token is empty or the HTTP client cannot be created.
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ProviderError::Config("Hetzner API token is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            token,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Make an authenticated GET request.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, ?query, "GET request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request with a JSON body.
    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// POST to an action endpoint, ignoring the returned action.
    async fn post_action<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ProviderError> {
        let _: serde_json::Value = self.post(path, body).await?;
        Ok(())
    }

    /// Make an authenticated DELETE request.
    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::error_for(status, text))
        }
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else {
            Err(Self::error_for(status, text))
        }
    }

    /// Map a failed response onto a provider error, preferring the API's own message.
    fn error_for(status: StatusCode, text: String) -> ProviderError {
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| format!("{} ({})", e.error.message, e.error.code))
            .unwrap_or(text);

        if status == StatusCode::NOT_FOUND {
            ProviderError::NotFound(message)
        } else {
            ProviderError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }

    /// Fetch every page of a listing.
    async fn list_all<R>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<R::Item>, ProviderError>
    where
        R: DeserializeOwned + Paged,
    {
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let mut params = query.to_vec();
            params.push(("page", page.to_string()));
            params.push(("per_page", PER_PAGE.to_string()));

            let response: R = self.get(path, &params).await?;
            let (mut batch, next) = response.into_page();
            items.append(&mut batch);

            match next {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        Ok(items)
    }

    /// Fetch the first resource whose name matches.
    async fn find_by_name<R>(&self, path: &str, name: &str) -> Result<Option<R::Item>, ProviderError>
    where
        R: DeserializeOwned + Paged,
    {
        let response: R = self.get(path, &[("name", name.to_string())]).await?;
        Ok(response.into_page().0.into_iter().next())
    }

    fn to_network(network: HcloudNetwork) -> Network {
        Network {
            id: network.id,
            name: network.name,
            ip_range: network.ip_range,
            subnets: network.subnets,
        }
    }

    fn to_firewall(firewall: HcloudFirewall) -> Firewall {
        Firewall {
            id: firewall.id,
            name: firewall.name,
            rules: firewall.rules,
        }
    }

    fn to_ssh_key(key: HcloudSshKey) -> SshKey {
        SshKey {
            id: key.id,
            name: key.name,
            fingerprint: key.fingerprint,
        }
    }

    fn to_placement_group(group: HcloudPlacementGroup) -> PlacementGroup {
        PlacementGroup {
            id: group.id,
            name: group.name,
            servers: group.servers,
        }
    }

    fn to_load_balancer(lb: HcloudLoadBalancer) -> LoadBalancer {
        let targets = lb
            .targets
            .into_iter()
            .map(|t| match (t.kind.as_str(), t.label_selector, t.server) {
                ("label_selector", Some(selector), _) => {
                    LoadBalancerTarget::LabelSelector(selector.selector)
                }
                ("server", _, Some(server)) => LoadBalancerTarget::Server(server.id),
                _ => LoadBalancerTarget::Other,
            })
            .collect();

        LoadBalancer {
            id: lb.id,
            name: lb.name,
            public_ipv4: lb.public_net.ipv4.and_then(|v4| v4.ip),
            targets,
        }
    }

    /// Convert a Hetzner server to our Server type.
    fn to_server(server: HcloudServer) -> Server {
        let status = serde_json::from_value(serde_json::Value::String(server.status))
            .unwrap_or(ServerStatus::Unknown);

        Server {
            id: server.id,
            name: server.name,
            status,
            public_ipv4: server.public_net.ipv4.and_then(|v4| v4.ip),
            private_ipv4: server.private_net.into_iter().find_map(|net| net.ip),
            server_type: server.server_type.name,
            location: server.datacenter.location.name,
            labels: server.labels,
        }
    }
}

#[async_trait]
impl CloudProvider for HetznerCloud {
    async fn get_network(&self, name: &str) -> Result<Option<Network>, ProviderError> {
        Ok(self
            .find_by_name::<NetworkListResponse>("/networks", name)
            .await?
            .map(Self::to_network))
    }

    async fn create_network(&self, req: CreateNetworkRequest) -> Result<Network, ProviderError> {
        info!(name = %req.name, ip_range = %req.ip_range, "Creating network");
        let body = CreateNetworkBody {
            name: &req.name,
            ip_range: &req.ip_range,
            subnets: &req.subnets,
        };
        let response: NetworkResponse = self.post("/networks", &body).await?;
        Ok(Self::to_network(response.network))
    }

    async fn add_subnet(&self, network_id: u64, subnet: Subnet) -> Result<(), ProviderError> {
        info!(network_id, ip_range = %subnet.ip_range, zone = %subnet.network_zone, "Adding subnet");
        self.post_action(&format!("/networks/{network_id}/actions/add_subnet"), &subnet)
            .await
    }

    async fn delete_network(&self, id: u64) -> Result<(), ProviderError> {
        self.delete(&format!("/networks/{id}")).await
    }

    async fn get_firewall(&self, name: &str) -> Result<Option<Firewall>, ProviderError> {
        Ok(self
            .find_by_name::<FirewallListResponse>("/firewalls", name)
            .await?
            .map(Self::to_firewall))
    }

    async fn create_firewall(
        &self,
        req: CreateFirewallRequest,
    ) -> Result<Firewall, ProviderError> {
        info!(name = %req.name, rules = req.rules.len(), "Creating firewall");
        let body = FirewallRulesBody {
            name: Some(&req.name),
            rules: &req.rules,
        };
        let response: FirewallResponse = self.post("/firewalls", &body).await?;
        Ok(Self::to_firewall(response.firewall))
    }

    async fn set_firewall_rules(
        &self,
        firewall_id: u64,
        rules: Vec<FirewallRule>,
    ) -> Result<(), ProviderError> {
        debug!(firewall_id, rules = rules.len(), "Setting firewall rules");
        let body = FirewallRulesBody {
            name: None,
            rules: &rules,
        };
        self.post_action(&format!("/firewalls/{firewall_id}/actions/set_rules"), &body)
            .await
    }

    async fn delete_firewall(&self, id: u64) -> Result<(), ProviderError> {
        self.delete(&format!("/firewalls/{id}")).await
    }

    async fn get_ssh_key(&self, name: &str) -> Result<Option<SshKey>, ProviderError> {
        Ok(self
            .find_by_name::<SshKeyListResponse>("/ssh_keys", name)
            .await?
            .map(Self::to_ssh_key))
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<SshKey, ProviderError> {
        info!(name = %name, "Uploading SSH public key");
        let body = CreateSshKeyBody { name, public_key };
        let response: SshKeyResponse = self.post("/ssh_keys", &body).await?;
        Ok(Self::to_ssh_key(response.ssh_key))
    }

    async fn delete_ssh_key(&self, id: u64) -> Result<(), ProviderError> {
        self.delete(&format!("/ssh_keys/{id}")).await
    }

    async fn get_placement_group(
        &self,
        name: &str,
    ) -> Result<Option<PlacementGroup>, ProviderError> {
        Ok(self
            .find_by_name::<PlacementGroupListResponse>("/placement_groups", name)
            .await?
            .map(Self::to_placement_group))
    }

    async fn create_placement_group(&self, name: &str) -> Result<PlacementGroup, ProviderError> {
        info!(name = %name, "Creating placement group");
        let body = CreatePlacementGroupBody { name, kind: "spread" };
        let response: PlacementGroupResponse = self.post("/placement_groups", &body).await?;
        Ok(Self::to_placement_group(response.placement_group))
    }

    async fn delete_placement_group(&self, id: u64) -> Result<(), ProviderError> {
        self.delete(&format!("/placement_groups/{id}")).await
    }

    async fn get_load_balancer(
        &self,
        name: &str,
    ) -> Result<Option<LoadBalancer>, ProviderError> {
        Ok(self
            .find_by_name::<LoadBalancerListResponse>("/load_balancers", name)
            .await?
            .map(Self::to_load_balancer))
    }

    async fn create_load_balancer(
        &self,
        req: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer, ProviderError> {
        info!(name = %req.name, location = %req.location, "Creating load balancer");
        let body = CreateLoadBalancerBody {
            name: &req.name,
            load_balancer_type: &req.load_balancer_type,
            algorithm: Algorithm {
                kind: "round_robin",
            },
            location: &req.location,
            network: req.network_id,
            public_interface: true,
            services: vec![LoadBalancerService {
                protocol: "tcp",
                listen_port: req.port,
                destination_port: req.port,
                proxyprotocol: false,
            }],
            targets: vec![LabelSelectorTarget::new(&req.label_selector)],
        };
        let response: LoadBalancerResponse = self.post("/load_balancers", &body).await?;
        Ok(Self::to_load_balancer(response.load_balancer))
    }

    async fn add_load_balancer_target(
        &self,
        load_balancer_id: u64,
        selector: &str,
    ) -> Result<(), ProviderError> {
        info!(load_balancer_id, selector = %selector, "Adding load balancer target");
        self.post_action(
            &format!("/load_balancers/{load_balancer_id}/actions/add_target"),
            &LabelSelectorTarget::new(selector),
        )
        .await
    }

    async fn delete_load_balancer(&self, id: u64) -> Result<(), ProviderError> {
        self.delete(&format!("/load_balancers/{id}")).await
    }

    async fn get_server(&self, name: &str) -> Result<Option<Server>, ProviderError> {
        Ok(self
            .find_by_name::<ServerListResponse>("/servers", name)
            .await?
            .map(Self::to_server))
    }

    async fn create_server(&self, req: CreateServerRequest) -> Result<Server, ProviderError> {
        info!(
            name = %req.name,
            server_type = %req.server_type,
            location = %req.location,
            "Creating server"
        );
        let body = CreateServerBody {
            name: &req.name,
            server_type: &req.server_type,
            image: &req.image,
            location: &req.location,
            ssh_keys: vec![req.ssh_key_id],
            networks: vec![req.network_id],
            firewalls: vec![FirewallRef {
                firewall: req.firewall_id,
            }],
            placement_group: req.placement_group_id,
            labels: &req.labels,
            user_data: &req.user_data,
            start_after_create: true,
        };
        let response: ServerResponse = self.post("/servers", &body).await?;
        Ok(Self::to_server(response.server))
    }

    async fn delete_server(&self, id: u64) -> Result<(), ProviderError> {
        self.delete(&format!("/servers/{id}")).await
    }

    async fn list_servers(&self) -> Result<Vec<Server>, ProviderError> {
        Ok(self
            .list_all::<ServerListResponse>("/servers", &[])
            .await?
            .into_iter()
            .map(Self::to_server)
            .collect())
    }

    async fn list_locations(&self) -> Result<Vec<Location>, ProviderError> {
        Ok(self
            .list_all::<LocationListResponse>("/locations", &[])
            .await?
            .into_iter()
            .map(|l| Location {
                name: l.name,
                network_zone: l.network_zone,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn server_json(id: u64, name: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "status": "running",
            "public_net": { "ipv4": { "ip": format!("203.0.113.{id}") } },
            "private_net": [{ "network": 1, "ip": format!("10.0.0.{id}") }],
            "server_type": { "name": "cpx21" },
            "datacenter": { "location": { "name": "nbg1" } },
            "labels": { "cluster": "demo", "role": "master" }
        })
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(
            HetznerCloud::new(""),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn test_server_conversion() {
        let raw: HcloudServer =
            serde_json::from_value(server_json(3, "demo-cpx21-master1")).unwrap();
        let server = HetznerCloud::to_server(raw);
        assert_eq!(server.status, ServerStatus::Running);
        assert_eq!(server.public_ipv4.as_deref(), Some("203.0.113.3"));
        assert_eq!(server.private_ipv4.as_deref(), Some("10.0.0.3"));
        assert_eq!(server.location, "nbg1");
        assert_eq!(server.labels["role"], "master");
    }

    #[test]
    fn test_load_balancer_without_ip() {
        let raw: HcloudLoadBalancer = serde_json::from_value(json!({
            "id": 9,
            "name": "demo-api",
            "public_net": { "ipv4": { "ip": null } },
            "targets": [
                { "type": "label_selector", "label_selector": { "selector": "cluster=demo,role=master" } },
                { "type": "server", "server": { "id": 4 } }
            ]
        }))
        .unwrap();
        let lb = HetznerCloud::to_load_balancer(raw);
        assert!(lb.public_ipv4.is_none());
        assert!(lb.has_selector("cluster=demo,role=master"));
        assert_eq!(lb.targets[1], LoadBalancerTarget::Server(4));
    }

    #[tokio::test]
    async fn test_list_servers_follows_pages() {
        let mock = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/servers"))
            .and(query_param("page", "1"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "servers": [server_json(1, "a"), server_json(2, "b")],
                "meta": { "pagination": { "page": 1, "next_page": 2 } }
            })))
            .expect(1)
            .mount(&mock)
            .await;

        Mock::given(method("GET"))
            .and(path("/servers"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "servers": [server_json(3, "c")],
                "meta": { "pagination": { "page": 2, "next_page": null } }
            })))
            .expect(1)
            .mount(&mock)
            .await;

        let cloud = HetznerCloud::with_base_url("token", mock.uri()).unwrap();
        let servers = cloud.list_servers().await.unwrap();
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_get_missing_network_is_none() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/networks"))
            .and(query_param("name", "demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "networks": [],
                "meta": { "pagination": { "page": 1, "next_page": null } }
            })))
            .mount(&mock)
            .await;

        let cloud = HetznerCloud::with_base_url("token", mock.uri()).unwrap();
        assert!(cloud.get_network("demo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_server_body() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .and(body_partial_json(json!({
                "name": "demo-cpx21-master1",
                "ssh_keys": [11],
                "networks": [12],
                "firewalls": [{ "firewall": 13 }],
                "placement_group": 14,
                "start_after_create": true
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "server": server_json(1, "demo-cpx21-master1")
            })))
            .expect(1)
            .mount(&mock)
            .await;

        let cloud = HetznerCloud::with_base_url("token", mock.uri()).unwrap();
        let server = cloud
            .create_server(CreateServerRequest {
                name: "demo-cpx21-master1".to_string(),
                server_type: "cpx21".to_string(),
                image: "ubuntu-20.04".to_string(),
                location: "nbg1".to_string(),
                ssh_key_id: 11,
                network_id: 12,
                firewall_id: 13,
                placement_group_id: Some(14),
                labels: std::collections::BTreeMap::new(),
                user_data: "#cloud-config".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(server.id, 1);
    }

    #[tokio::test]
    async fn test_api_error_message_extracted() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ssh_keys"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": { "code": "uniqueness_error", "message": "SSH key not unique" }
            })))
            .mount(&mock)
            .await;

        let cloud = HetznerCloud::with_base_url("token", mock.uri()).unwrap();
        let err = cloud.create_ssh_key("demo", "ssh-ed25519 AAAA").await.unwrap_err();
        match err {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "SSH key not unique (uniqueness_error)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_treats_204_as_success() {
        let mock = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/firewalls/5"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock)
            .await;

        let cloud = HetznerCloud::with_base_url("token", mock.uri()).unwrap();
        cloud.delete_firewall(5).await.unwrap();
    }
}
