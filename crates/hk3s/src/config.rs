//! Cluster configuration.
//!
//! The configuration file is YAML. It is loaded once, checked for
//! structural problems, and then shared read-only (`Arc<ClusterSpec>`)
//! with every component that needs it.

use std::path::{Path, PathBuf};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Master node pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterPool {
    /// Server type (e.g. `cpx21`).
    pub instance_type: String,
    /// Number of masters.
    pub instance_count: usize,
}

/// Statically sized worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPool {
    /// Pool name, part of every server name in the pool.
    pub name: String,
    /// Server type.
    pub instance_type: String,
    /// Number of workers.
    pub instance_count: usize,
    /// Location override; defaults to the cluster location.
    #[serde(default)]
    pub location: Option<String>,
}

/// Worker pool managed by the cluster autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingPool {
    /// Pool name.
    pub name: String,
    /// Server type.
    pub instance_type: String,
    /// Minimum pool size.
    #[serde(default)]
    pub instance_min: usize,
    /// Maximum pool size.
    pub instance_max: usize,
    /// Location override; defaults to the cluster location.
    #[serde(default)]
    pub location: Option<String>,
}

/// Full cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    // Credentials
    /// Hetzner Cloud API token.
    #[serde(default)]
    pub hetzner_token: String,

    // Identity
    /// Cluster name; prefixes every resource.
    pub cluster_name: String,
    /// Where the admin kubeconfig is written.
    pub kubeconfig_path: String,
    /// k3s release, e.g. `v1.24.3+k3s1`.
    pub k3s_version: String,

    // SSH
    /// Public key uploaded to the project.
    #[serde(default = "default_public_ssh_key_path")]
    pub public_ssh_key_path: String,
    /// Private key used to reach the servers.
    #[serde(default = "default_private_ssh_key_path")]
    pub private_ssh_key_path: String,
    /// Check host keys against `~/.ssh/known_hosts` (trust on first use).
    #[serde(default)]
    pub verify_host_key: bool,

    // Network access
    /// Sources allowed to reach port 22.
    #[serde(default = "default_allowed_networks")]
    pub ssh_allowed_networks: Vec<String>,
    /// Sources allowed to reach the Kubernetes API.
    #[serde(default = "default_allowed_networks")]
    pub api_allowed_networks: Vec<String>,
    /// Reuse this private network instead of creating one.
    #[serde(default)]
    pub existing_network: Option<String>,
    /// Range of the private network.
    #[serde(default = "default_network_ip_range")]
    pub network_ip_range: String,

    // Topology
    /// Location of the masters (and default for pools).
    pub location: String,
    /// Master pool.
    pub masters: MasterPool,
    /// Static worker pools.
    #[serde(default)]
    pub worker_node_pools: Vec<WorkerPool>,
    /// Autoscaled worker pools.
    #[serde(default)]
    pub autoscaling_node_pools: Vec<AutoscalingPool>,
    /// Server image.
    #[serde(default = "default_image")]
    pub image: String,

    // Features
    /// Leave masters schedulable for ordinary workloads.
    #[serde(default)]
    pub schedule_workloads_on_masters: bool,
    /// Encrypt pod traffic with WireGuard.
    #[serde(default)]
    pub enable_encryption: bool,
    /// Run the CSI controller on masters.
    #[serde(default)]
    pub schedule_csi_controller_on_master: bool,
    /// Make the Hetzner volume class the default storage class.
    #[serde(default = "default_true")]
    pub hcloud_volume_is_default_storage_class: bool,
    /// Blacklist local disks from multipathd.
    #[serde(default)]
    pub fix_multipath: bool,

    // Node customisation
    /// Extra packages installed by cloud-init.
    #[serde(default)]
    pub additional_packages: Vec<String>,
    /// Extra commands run by cloud-init.
    #[serde(default)]
    pub post_create_commands: Vec<String>,
    /// Nameservers written to `/etc/resolv.conf`.
    #[serde(default = "default_nameservers")]
    pub default_nameservers: Vec<String>,

    // Control plane flags
    #[serde(default)]
    pub kube_api_server_args: Vec<String>,
    #[serde(default)]
    pub kube_scheduler_args: Vec<String>,
    #[serde(default)]
    pub kube_controller_manager_args: Vec<String>,
    #[serde(default)]
    pub kube_cloud_controller_manager_args: Vec<String>,
    #[serde(default)]
    pub kubelet_args: Vec<String>,
    #[serde(default)]
    pub kube_proxy_args: Vec<String>,

    // Autoscaler
    #[serde(default)]
    pub cluster_autoscaler_args: Vec<String>,
    #[serde(default = "default_autoscaler_version")]
    pub cluster_autoscaler_version: String,
}

fn default_public_ssh_key_path() -> String {
    "~/.ssh/id_rsa.pub".to_string()
}

fn default_private_ssh_key_path() -> String {
    "~/.ssh/id_rsa".to_string()
}

fn default_allowed_networks() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

fn default_network_ip_range() -> String {
    "10.0.0.0/16".to_string()
}

fn default_image() -> String {
    "ubuntu-20.04".to_string()
}

fn default_nameservers() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}

fn default_autoscaler_version() -> String {
    "v1.23.0".to_string()
}

fn default_true() -> bool {
    true
}

impl ClusterSpec {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a configuration document.
    ///
    /// # Errors
    /// Returns an error if the YAML is malformed or fails validation.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("cannot parse configuration: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Structural checks on the configuration.
    ///
    /// # Errors
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.cluster_name) {
            return Err(Error::Config(format!(
                "cluster_name '{}' must be a lowercase DNS label",
                self.cluster_name
            )));
        }
        if !self.k3s_version.starts_with('v') {
            return Err(Error::Config(format!(
                "k3s_version '{}' must look like v1.24.3+k3s1",
                self.k3s_version
            )));
        }
        if self.masters.instance_count == 0 {
            return Err(Error::Config("masters.instance_count must be at least 1".into()));
        }
        for pool in &self.worker_node_pools {
            if pool.instance_count == 0 {
                return Err(Error::Config(format!(
                    "worker pool '{}' must have at least one instance",
                    pool.name
                )));
            }
        }
        for pool in &self.autoscaling_node_pools {
            if pool.instance_max == 0 || pool.instance_min > pool.instance_max {
                return Err(Error::Config(format!(
                    "autoscaling pool '{}' needs 0 <= instance_min <= instance_max and instance_max > 0",
                    pool.name
                )));
            }
        }
        parse_cidr(&self.network_ip_range)?;
        for cidr in self
            .ssh_allowed_networks
            .iter()
            .chain(&self.api_allowed_networks)
        {
            parse_cidr(cidr)?;
        }
        Ok(())
    }

    /// Name of the private network (existing or cluster-owned).
    #[must_use]
    pub fn network_name(&self) -> &str {
        self.existing_network
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.cluster_name)
    }

    /// Whether the private network is owned by another party.
    #[must_use]
    pub fn uses_existing_network(&self) -> bool {
        self.existing_network
            .as_deref()
            .is_some_and(|name| !name.is_empty())
    }

    /// Network zone derived from the location.
    #[must_use]
    pub fn network_zone(&self) -> &'static str {
        match self.location.as_str() {
            "ash" => "us-east",
            "hil" => "us-west",
            _ => "eu-central",
        }
    }

    /// Whether the API is served through a load balancer.
    #[must_use]
    pub fn is_multi_master(&self) -> bool {
        self.masters.instance_count > 1
    }

    /// Kubeconfig path with `~` expanded.
    #[must_use]
    pub fn kubeconfig_path(&self) -> PathBuf {
        expand_home(&self.kubeconfig_path)
    }

    /// Public key path with `~` expanded.
    #[must_use]
    pub fn public_key_path(&self) -> PathBuf {
        expand_home(&self.public_ssh_key_path)
    }

    /// Private key path with `~` expanded.
    #[must_use]
    pub fn private_key_path(&self) -> PathBuf {
        expand_home(&self.private_ssh_key_path)
    }

    /// Location of a pool, falling back to the cluster location.
    #[must_use]
    pub fn pool_location<'a>(&'a self, location: Option<&'a str>) -> &'a str {
        location
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.location)
    }
}

/// Parse a CIDR, accepting a bare address as a host route.
///
/// # Errors
/// Returns [`Error::Config`] if the value is not a network.
pub fn parse_cidr(value: &str) -> Result<IpNet> {
    value
        .parse::<IpNet>()
        .or_else(|_| value.parse::<std::net::IpAddr>().map(IpNet::from))
        .map_err(|_| Error::Config(format!("'{value}' is not a valid CIDR")))
}

/// Resolve `~` and `~/...` against the current user's home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return PathBuf::from(path);
    };
    if path == "~" {
        home
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(path)
    }
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
