//! k3s cluster provisioning on Hetzner Cloud.
//!
//! This crate reconciles the cloud resources a cluster needs (network,
//! firewall, SSH key, placement groups, load balancer, servers), bootstraps
//! k3s on the servers over SSH, installs the cluster addons, and tears the
//! whole thing down again.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use hk3s::addons::KubectlApplier;
//! use hk3s::cluster::Cluster;
//! use hk3s::config::ClusterSpec;
//! use hk3s::providers::hetzner::HetznerCloud;
//! use hk3s::ssh::SshExecutor;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let spec = Arc::new(ClusterSpec::load("cluster.yaml")?);
//!     let provider = Arc::new(HetznerCloud::new(&spec.hetzner_token)?);
//!     let executor = Arc::new(SshExecutor::new(&spec, false));
//!     let applier = Arc::new(KubectlApplier::new(spec.kubeconfig_path()));
//!
//!     Cluster::new(spec, provider, executor, applier, CancellationToken::new())?
//!         .create()
//!         .await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod addons;
pub mod cluster;
pub mod config;
pub mod error;
pub mod k3s;
pub mod kubeconfig;
pub mod naming;
pub mod preflight;
pub mod providers;
pub mod provision;
pub mod readiness;
pub mod reconcile;
pub mod releases;
pub mod retry;
pub mod ssh;
pub mod state;
pub mod tasks;
pub mod teardown;
mod templates;

pub use cluster::Cluster;
pub use config::ClusterSpec;
pub use error::{Error, Result};
pub use providers::{CloudProvider, ProviderError};
pub use ssh::RemoteExecutor;
