//! Administrative kubeconfig of the cluster.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::ssh::RemoteExecutor;

/// Command printing the kubeconfig k3s writes on a server.
pub const KUBECONFIG_COMMAND: &str = "cat /etc/rancher/k3s/k3s.yaml";

/// Point a server-local kubeconfig at `api_address` and name its
/// cluster, context and user after `cluster_name`.
#[must_use]
pub fn rewrite(raw: &str, api_address: &str, cluster_name: &str) -> String {
    raw.replace("127.0.0.1", api_address)
        .replace("default", cluster_name)
}

/// Write `content` to `path`, readable by the owner only.
///
/// Missing parent directories are created owner and group accessible.
///
/// # Errors
/// Returns an error if `path` is a directory or cannot be written.
pub fn write(path: &Path, content: &str) -> Result<()> {
    if path.is_dir() {
        return Err(Error::Config(format!(
            "kubeconfig path {} is a directory",
            path.display()
        )));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o750);
        }
        builder.create(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())?;

    // An existing file keeps its mode on open; tighten it explicitly.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Read the kubeconfig from the first master and save it locally.
///
/// # Errors
/// Returns an error if the remote read or the local write fails.
pub async fn save(
    executor: &dyn RemoteExecutor,
    first_master_address: &str,
    api_address: &str,
    cluster_name: &str,
    path: &Path,
) -> Result<()> {
    let raw = executor
        .run(first_master_address, KUBECONFIG_COMMAND)
        .await
        .map_err(|e| Error::remote(first_master_address, e))?;

    write(path, &rewrite(&raw, api_address, cluster_name))?;
    info!(path = %path.display(), "Kubeconfig saved");
    Ok(())
}
