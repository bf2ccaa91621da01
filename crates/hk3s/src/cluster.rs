//! Top-level workflows.
//!
//! [`Cluster`] wires the components together for one run: preflight,
//! provisioning, bootstrap and addons for `create`; preflight and
//! teardown for `delete`; preflight and the upgrade plans for `upgrade`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::addons::{AddonDeployer, AutoscalerJoin, ManifestApplier};
use crate::config::ClusterSpec;
use crate::error::{Error, Result};
use crate::k3s::{upgrade, Bootstrapper};
use crate::preflight::Preflight;
use crate::providers::{CloudProvider, Server};
use crate::provision::Provisioner;
use crate::releases::ReleaseClient;
use crate::retry::RetryConfig;
use crate::ssh::RemoteExecutor;
use crate::state::ClusterState;
use crate::tasks::cancellable;
use crate::teardown::{Teardown, TeardownReport};

/// One cluster and the collaborators used to manage it.
pub struct Cluster {
    spec: Arc<ClusterSpec>,
    provider: Arc<dyn CloudProvider>,
    executor: Arc<dyn RemoteExecutor>,
    applier: Arc<dyn ManifestApplier>,
    cancel: CancellationToken,
    state: Arc<ClusterState>,
    releases: ReleaseClient,
    public_ip_url: Option<String>,
    csi_url: Option<String>,
    readiness: RetryConfig,
    teardown_pause: Duration,
}

impl Cluster {
    /// Cluster described by `spec`.
    ///
    /// # Errors
    /// Returns an error if the release client cannot be created.
    pub fn new(
        spec: Arc<ClusterSpec>,
        provider: Arc<dyn CloudProvider>,
        executor: Arc<dyn RemoteExecutor>,
        applier: Arc<dyn ManifestApplier>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            state: Arc::new(ClusterState::new(spec.clone(), provider.clone())),
            spec,
            provider,
            executor,
            applier,
            cancel,
            releases: ReleaseClient::new(None)?,
            public_ip_url: None,
            csi_url: None,
            readiness: RetryConfig::readiness(),
            teardown_pause: Duration::from_secs(1),
        })
    }

    /// Use `releases` to check versions.
    #[must_use]
    pub fn with_releases(mut self, releases: ReleaseClient) -> Self {
        self.releases = releases;
        self
    }

    /// Look up the public address at `url`.
    #[must_use]
    pub fn with_public_ip_url(mut self, url: impl Into<String>) -> Self {
        self.public_ip_url = Some(url.into());
        self
    }

    /// Download the CSI manifest from `url`.
    #[must_use]
    pub fn with_csi_url(mut self, url: impl Into<String>) -> Self {
        self.csi_url = Some(url.into());
        self
    }

    /// Override the readiness polling policy.
    #[must_use]
    pub fn with_readiness_policy(mut self, policy: RetryConfig) -> Self {
        self.readiness = policy;
        self
    }

    /// Override how long to wait for the load balancer's public address.
    #[must_use]
    pub fn with_load_balancer_retry(mut self, retry: RetryConfig) -> Self {
        self.state = Arc::new(
            ClusterState::new(self.spec.clone(), self.provider.clone())
                .with_load_balancer_retry(retry),
        );
        self
    }

    /// Override the pause between teardown steps.
    #[must_use]
    pub fn with_teardown_pause(mut self, pause: Duration) -> Self {
        self.teardown_pause = pause;
        self
    }

    /// State resolved during this run.
    #[must_use]
    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    fn preflight(&self) -> Preflight {
        let preflight = Preflight::new(
            self.spec.clone(),
            self.provider.clone(),
            self.releases.clone(),
        );
        match &self.public_ip_url {
            Some(url) => preflight.with_public_ip_url(url.clone()),
            None => preflight,
        }
    }

    /// Create the cluster, or complete a partially created one.
    ///
    /// # Errors
    /// Returns the first failure; resources created so far are kept.
    pub async fn create(&self) -> Result<()> {
        cancellable(&self.cancel, self.run_create()).await
    }

    async fn run_create(&self) -> Result<()> {
        self.preflight().create(self.executor.as_ref()).await?;

        info!(cluster = %self.spec.cluster_name, "Creating cluster");
        Provisioner::new(self.state.clone(), self.executor.clone(), self.cancel.clone())
            .with_readiness_policy(self.readiness.clone())
            .provision()
            .await?;

        let bootstrapper =
            Bootstrapper::new(self.state.clone(), self.executor.clone(), self.cancel.clone());
        bootstrapper.deploy().await?;

        let token = bootstrapper.token().await?;
        let first_master = self.state.resolve_servers().await?.first_master()?.clone();
        let first_master_private_ip = self
            .state
            .reconciler()
            .refresh_server(first_master)
            .await?
            .private_ipv4
            .ok_or_else(|| Error::Config("first master has no private address".into()))?;

        let mut addons =
            AddonDeployer::new(self.spec.clone(), self.applier.clone(), self.cancel.clone());
        if let Some(url) = &self.csi_url {
            addons = addons.with_csi_url(url.clone());
        }
        addons
            .deploy(&AutoscalerJoin {
                token,
                first_master_private_ip,
            })
            .await?;

        info!(
            cluster = %self.spec.cluster_name,
            kubeconfig = %self.spec.kubeconfig_path().display(),
            "Cluster ready"
        );
        Ok(())
    }

    /// Delete every resource of the cluster.
    ///
    /// Failed deletions are logged and recorded in the report; they do not
    /// stop the teardown.
    ///
    /// # Errors
    /// Returns an error if preflight fails or the servers cannot be listed.
    pub async fn delete(&self) -> Result<TeardownReport> {
        cancellable(&self.cancel, async {
            self.preflight().delete().await?;
            let servers = self.state.resolve_servers().await?.all.clone();
            Ok(Teardown::new(self.spec.clone(), self.provider.clone())
                .with_pause(self.teardown_pause)
                .run(&servers)
                .await)
        })
        .await
    }

    /// Upgrade k3s to `new_version`, or to the configured version.
    ///
    /// # Errors
    /// Returns an error if preflight fails or a plan cannot be applied.
    pub async fn upgrade(&self, new_version: Option<&str>) -> Result<()> {
        let version = new_version.unwrap_or(&self.spec.k3s_version);

        cancellable(&self.cancel, async {
            self.preflight().upgrade(version).await?;
            let workers = self.state.resolve_servers().await?.workers.len();

            self.applier
                .ensure_available()
                .await
                .map_err(|e| Error::Manifest {
                    step: "find kubectl".to_string(),
                    message: e.to_string(),
                })?;

            info!(cluster = %self.spec.cluster_name, version, workers, "Upgrading cluster");
            upgrade::apply_plans(self.applier.as_ref(), version, workers).await
        })
        .await
    }

    /// Servers of the cluster, sorted by name.
    ///
    /// # Errors
    /// Returns an error if the listing fails.
    pub async fn list_servers(&self) -> Result<Vec<Server>> {
        Ok(self.state.resolve_servers().await?.all.clone())
    }
}
