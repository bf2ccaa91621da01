//! Checks run before anything is mutated.
//!
//! Each operation has its own checklist; the first failing check aborts
//! the operation with [`Error::Preflight`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{parse_cidr, ClusterSpec};
use crate::error::{Error, Result};
use crate::providers::CloudProvider;
use crate::releases::ReleaseClient;
use crate::ssh::{self, RemoteExecutor};

/// Service answering with the caller's public address.
const PUBLIC_IP_URL: &str = "http://whatismyip.akamai.com";

fn fail(message: impl Into<String>) -> Error {
    Error::Preflight(message.into())
}

/// Check that `ip` falls in at least one of `networks`.
///
/// # Errors
/// Returns [`Error::Preflight`] if no network contains the address.
pub fn ensure_allowed(ip: IpAddr, networks: &[String], kind: &str) -> Result<()> {
    for network in networks {
        if parse_cidr(network)?.contains(&ip) {
            return Ok(());
        }
    }
    Err(fail(format!(
        "your current IP {ip} is not included in any of the allowed {kind} networks"
    )))
}

/// Per-operation preflight checks.
pub struct Preflight {
    spec: Arc<ClusterSpec>,
    provider: Arc<dyn CloudProvider>,
    releases: ReleaseClient,
    http: reqwest::Client,
    public_ip_url: String,
}

impl Preflight {
    pub fn new(
        spec: Arc<ClusterSpec>,
        provider: Arc<dyn CloudProvider>,
        releases: ReleaseClient,
    ) -> Self {
        Self {
            spec,
            provider,
            releases,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            public_ip_url: PUBLIC_IP_URL.to_string(),
        }
    }

    /// Ask `url` for the public address instead of the default service.
    #[must_use]
    pub fn with_public_ip_url(mut self, url: impl Into<String>) -> Self {
        self.public_ip_url = url.into();
        self
    }

    /// Public address of this host.
    ///
    /// # Errors
    /// Returns [`Error::Preflight`] if the lookup fails.
    pub async fn public_ip(&self) -> Result<IpAddr> {
        let body = self
            .http
            .get(&self.public_ip_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| fail(format!("cannot fetch public IP address: {e}")))?
            .text()
            .await
            .map_err(|e| fail(format!("cannot fetch public IP address: {e}")))?;

        body.trim()
            .parse()
            .map_err(|_| fail(format!("cannot parse public IP address '{}'", body.trim())))
    }

    /// Checks before creating a cluster.
    ///
    /// An encrypted private key's passphrase is asked for here and handed
    /// to `executor`.
    ///
    /// # Errors
    /// Returns the first failed check.
    pub async fn create(&self, executor: &dyn RemoteExecutor) -> Result<()> {
        info!("Validating configuration");
        self.spec.validate()?;
        self.check_keys(executor)?;

        let ip = self.public_ip().await?;
        debug!(ip = %ip, "Public address");
        ensure_allowed(ip, &self.spec.ssh_allowed_networks, "SSH")?;
        ensure_allowed(ip, &self.spec.api_allowed_networks, "API")?;

        let locations = self
            .provider
            .list_locations()
            .await
            .map_err(|e| fail(format!("cannot validate Hetzner token: {e}")))?;

        self.check_version(&self.spec.k3s_version).await?;

        let valid = locations.iter().map(|l| l.name.as_str()).collect::<Vec<_>>();
        let wanted = std::iter::once(self.spec.location.as_str()).chain(
            self.spec
                .worker_node_pools
                .iter()
                .filter_map(|p| p.location.as_deref())
                .chain(
                    self.spec
                        .autoscaling_node_pools
                        .iter()
                        .filter_map(|p| p.location.as_deref()),
                ),
        );
        for location in wanted {
            if !valid.contains(&location) {
                return Err(fail(format!(
                    "invalid location {location}; valid locations: {}",
                    valid.join(", ")
                )));
            }
        }

        if self.spec.uses_existing_network() {
            let name = self.spec.network_name();
            let found = self
                .provider
                .get_network(name)
                .await
                .map_err(|e| fail(format!("cannot find existing network {name}: {e}")))?;
            if found.is_none() {
                return Err(fail(format!("existing network {name} not found")));
            }
        }

        info!("Configuration is valid");
        Ok(())
    }

    /// Checks before deleting a cluster.
    ///
    /// # Errors
    /// Returns the first failed check.
    pub async fn delete(&self) -> Result<()> {
        self.spec.validate()?;
        self.provider
            .list_locations()
            .await
            .map_err(|e| fail(format!("cannot validate Hetzner token: {e}")))?;
        Ok(())
    }

    /// Checks before upgrading a cluster to `version`.
    ///
    /// # Errors
    /// Returns the first failed check.
    pub async fn upgrade(&self, version: &str) -> Result<()> {
        self.spec.validate()?;

        let path = self.spec.kubeconfig_path();
        let metadata = std::fs::metadata(&path)
            .map_err(|e| fail(format!("cannot read kubeconfig {}: {e}", path.display())))?;
        if metadata.is_dir() {
            return Err(fail(format!("kubeconfig path {} is a directory", path.display())));
        }

        self.check_version(version).await
    }

    fn check_keys(&self, executor: &dyn RemoteExecutor) -> Result<()> {
        let public = self.spec.public_key_path();
        ssh::check_public_key(&public).map_err(|e| fail(e.to_string()))?;

        let private = self.spec.private_key_path();
        if private.is_dir() {
            return Err(fail(format!("private key path {} is a directory", private.display())));
        }
        let passphrase = ssh::resolve_passphrase(&private).map_err(|e| fail(e.to_string()))?;
        executor.set_passphrase(passphrase);
        Ok(())
    }

    async fn check_version(&self, version: &str) -> Result<()> {
        if self.releases.exists(version).await? {
            Ok(())
        } else {
            Err(fail(format!("k3s version {version} does not exist")))
        }
    }
}
