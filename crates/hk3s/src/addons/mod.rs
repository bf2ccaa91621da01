//! Cluster addons.
//!
//! Installed in order, each step an idempotent apply:
//!
//! 1. cloud controller manager secret and manifest
//! 2. system upgrade controller
//! 3. CSI driver secret, then the driver itself (its `CSIDriver` object is
//!    deleted first because `fsGroupPolicy` cannot be changed in place)
//! 4. CSI controller patch, when it should run on the masters
//! 5. cluster autoscaler secret and manifest, when any pool autoscales

pub mod applier;
pub mod manifests;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub use applier::{ApplyError, KubectlApplier, ManifestApplier};

use crate::config::ClusterSpec;
use crate::error::{Error, Result};
use crate::tasks::cancellable;
use crate::templates;

/// What the autoscaler needs to join new nodes.
#[derive(Debug, Clone)]
pub struct AutoscalerJoin {
    pub token: String,
    pub first_master_private_ip: String,
}

fn manifest_error(step: &str) -> impl FnOnce(ApplyError) -> Error + '_ {
    move |e| Error::Manifest {
        step: step.to_string(),
        message: e.to_string(),
    }
}

/// Installs the addons through a [`ManifestApplier`].
pub struct AddonDeployer {
    spec: Arc<ClusterSpec>,
    applier: Arc<dyn ManifestApplier>,
    http: reqwest::Client,
    csi_url: String,
    cancel: CancellationToken,
}

impl AddonDeployer {
    pub fn new(
        spec: Arc<ClusterSpec>,
        applier: Arc<dyn ManifestApplier>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            spec,
            applier,
            http: reqwest::Client::new(),
            csi_url: manifests::CSI_URL.to_string(),
            cancel,
        }
    }

    /// Download the CSI manifest from `url` instead of upstream.
    #[must_use]
    pub fn with_csi_url(mut self, url: impl Into<String>) -> Self {
        self.csi_url = url.into();
        self
    }

    /// Install every addon.
    ///
    /// # Errors
    /// Returns [`Error::Manifest`] naming the first step that failed.
    pub async fn deploy(&self, autoscaler: &AutoscalerJoin) -> Result<()> {
        self.applier
            .ensure_available()
            .await
            .map_err(manifest_error("find kubectl"))?;

        cancellable(&self.cancel, self.cloud_controller_manager()).await?;
        cancellable(&self.cancel, self.upgrade_controller()).await?;
        cancellable(&self.cancel, self.csi_driver()).await?;
        if !self.spec.autoscaling_node_pools.is_empty() {
            cancellable(&self.cancel, self.autoscaler(autoscaler)).await?;
        }
        Ok(())
    }

    async fn apply(&self, step: &str, manifest: &str) -> Result<()> {
        self.applier
            .apply(manifest)
            .await
            .map_err(manifest_error(step))
    }

    async fn cloud_controller_manager(&self) -> Result<()> {
        info!("Deploying Hetzner Cloud Controller Manager");
        self.apply(
            "deploy cloud controller manager secret",
            &manifests::ccm_secret(&self.spec)?,
        )
        .await?;
        self.applier
            .apply_url(manifests::CCM_URL)
            .await
            .map_err(manifest_error("deploy cloud controller manager"))?;
        info!("Cloud Controller Manager deployed");
        Ok(())
    }

    async fn upgrade_controller(&self) -> Result<()> {
        info!("Deploying k3s System Upgrade Controller");
        self.applier
            .apply_url(manifests::UPGRADE_CONTROLLER_URL)
            .await
            .map_err(manifest_error("deploy system upgrade controller"))?;
        info!("System Upgrade Controller deployed");
        Ok(())
    }

    async fn download_csi_driver(&self) -> Result<String> {
        let fail = |e: reqwest::Error| Error::Manifest {
            step: "download CSI driver manifest".to_string(),
            message: e.to_string(),
        };
        self.http
            .get(&self.csi_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fail)?
            .text()
            .await
            .map_err(fail)
    }

    async fn csi_driver(&self) -> Result<()> {
        info!("Deploying Hetzner CSI Driver");
        self.apply("deploy CSI driver secret", &manifests::csi_secret(&self.spec)?)
            .await?;

        let upstream = self.download_csi_driver().await?;
        let driver =
            manifests::csi_driver(&upstream, self.spec.hcloud_volume_is_default_storage_class)?;

        self.applier
            .delete(templates::CSI_DRIVER)
            .await
            .map_err(manifest_error("delete CSI driver object"))?;
        self.apply("deploy CSI driver", &driver).await?;
        info!("CSI Driver deployed");

        if self.spec.schedule_csi_controller_on_master {
            info!("Moving CSI controller to masters");
            self.apply("update CSI controller", templates::CSI_CONTROLLER)
                .await?;
        }
        Ok(())
    }

    async fn autoscaler(&self, join: &AutoscalerJoin) -> Result<()> {
        info!(pools = self.spec.autoscaling_node_pools.len(), "Deploying cluster autoscaler");
        self.apply(
            "deploy cluster autoscaler secret",
            &manifests::autoscaler_secret(&self.spec)?,
        )
        .await?;
        self.apply(
            "deploy cluster autoscaler",
            &manifests::autoscaler(&self.spec, &join.token, &join.first_master_private_ip)?,
        )
        .await?;
        info!("Cluster autoscaler deployed");
        Ok(())
    }
}
