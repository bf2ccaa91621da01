//! Applying manifests to the cluster.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::Builder;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from a manifest applier.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("kubectl is not installed or not in PATH")]
    NotInstalled,

    #[error("kubectl failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Applies manifests with the cluster's admin credentials.
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Fail unless the tool is usable from this host.
    async fn ensure_available(&self) -> Result<(), ApplyError>;

    /// Create or update the objects in `manifest`.
    async fn apply(&self, manifest: &str) -> Result<(), ApplyError>;

    /// Create or update the objects published at `url`.
    async fn apply_url(&self, url: &str) -> Result<(), ApplyError>;

    /// Delete the objects in `manifest`; missing objects are not an error.
    async fn delete(&self, manifest: &str) -> Result<(), ApplyError>;
}

/// [`ManifestApplier`] running the local `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlApplier {
    kubeconfig: PathBuf,
}

impl KubectlApplier {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String, ApplyError> {
        debug!(args = ?args, "Running kubectl");
        let output = Command::new("kubectl")
            .arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApplyError::Failed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run `args` against `manifest` written to a temporary file.
    async fn with_manifest(&self, args: &[&str], manifest: &str) -> Result<(), ApplyError> {
        let mut file = Builder::new().prefix("hk3s-").suffix(".yaml").tempfile()?;
        file.write_all(manifest.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().to_string();
        let mut full: Vec<&str> = args.to_vec();
        full.extend(["-f", path.as_str()]);
        self.kubectl(&full).await.map(|_| ())
    }
}

#[async_trait]
impl ManifestApplier for KubectlApplier {
    async fn ensure_available(&self) -> Result<(), ApplyError> {
        which::which("kubectl")
            .map(|_| ())
            .map_err(|_| ApplyError::NotInstalled)
    }

    async fn apply(&self, manifest: &str) -> Result<(), ApplyError> {
        self.with_manifest(&["apply"], manifest).await
    }

    async fn apply_url(&self, url: &str) -> Result<(), ApplyError> {
        self.kubectl(&["apply", "-f", url]).await.map(|_| ())
    }

    async fn delete(&self, manifest: &str) -> Result<(), ApplyError> {
        self.with_manifest(&["delete", "--ignore-not-found=true"], manifest)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ApplyError::NotInstalled.to_string(),
            "kubectl is not installed or not in PATH"
        );
        assert_eq!(
            ApplyError::Failed("forbidden".into()).to_string(),
            "kubectl failed: forbidden"
        );
    }
}
