//! Node installation scripts.

use semver::Version;
use serde_json::json;

use crate::config::ClusterSpec;
use crate::error::{Error, Result};
use crate::reconcile::API_PORT;
use crate::templates;

/// First release shipping the in-kernel WireGuard flannel backend.
const WIREGUARD_NATIVE_SINCE: &str = "1.23.6+k3s1";

const MASTER_TAINT: &str = "--node-taint CriticalAddonsOnly=true:NoExecute";

/// Inputs shared by every master script of one run.
#[derive(Debug, Clone)]
pub struct MasterContext<'a> {
    pub token: &'a str,
    /// Address joining masters reach the API on.
    pub api_address: &'a str,
    /// Private addresses of all masters, added as TLS SANs.
    pub master_private_ips: &'a [String],
}

/// Parse a k3s release name such as `v1.24.3+k3s1`.
///
/// # Errors
/// Returns [`Error::Config`] if the name is not a semantic version.
pub fn parse_version(name: &str) -> Result<Version> {
    Version::parse(name.trim_start_matches('v'))
        .map_err(|e| Error::Config(format!("'{name}' is not a valid k3s version: {e}")))
}

/// Flannel backend flag, empty unless encryption is enabled.
///
/// # Errors
/// Returns an error if the configured version cannot be parsed.
pub fn flannel_backend(spec: &ClusterSpec) -> Result<&'static str> {
    if !spec.enable_encryption {
        return Ok("");
    }
    let since = parse_version(WIREGUARD_NATIVE_SINCE)?;
    if parse_version(&spec.k3s_version)? >= since {
        Ok("--flannel-backend=wireguard-native")
    } else {
        Ok("--flannel-backend=wireguard")
    }
}

/// Taint keeping ordinary workloads off the masters.
#[must_use]
pub fn master_taint(spec: &ClusterSpec) -> &'static str {
    if spec.schedule_workloads_on_masters {
        ""
    } else {
        MASTER_TAINT
    }
}

/// Operator-supplied flags for every control-plane component.
#[must_use]
pub fn extra_args(spec: &ClusterSpec) -> String {
    let groups = [
        ("kube-apiserver-arg", &spec.kube_api_server_args),
        ("kube-scheduler-arg", &spec.kube_scheduler_args),
        ("kube-controller-manager-arg", &spec.kube_controller_manager_args),
        ("kube-cloud-controller-manager-arg", &spec.kube_cloud_controller_manager_args),
        ("kubelet-arg", &spec.kubelet_args),
        ("kube-proxy-arg", &spec.kube_proxy_args),
    ];

    groups
        .iter()
        .map(|(flag, values)| {
            values
                .iter()
                .map(|v| format!("--{flag}=\"{v}\" "))
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `--tls-san` flags for the API address and every master.
#[must_use]
pub fn tls_sans(api_address: &str, master_private_ips: &[String]) -> String {
    std::iter::once(api_address)
        .chain(master_private_ips.iter().map(String::as_str))
        .map(|ip| format!("--tls-san={ip}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Script installing k3s in server mode.
///
/// The first master initializes the cluster; every other master joins
/// through the API address.
///
/// # Errors
/// Returns an error if the version cannot be parsed or rendering fails.
pub fn master_script(spec: &ClusterSpec, ctx: &MasterContext<'_>, first: bool) -> Result<String> {
    let server = if first {
        "--cluster-init".to_string()
    } else {
        format!("--server https://{}:{API_PORT}", ctx.api_address)
    };

    templates::render(
        "master_script",
        templates::MASTER_SCRIPT,
        &json!({
            "k3s_version": spec.k3s_version,
            "token": ctx.token,
            "flannel_backend": flannel_backend(spec)?,
            "taint": master_taint(spec),
            "extra_args": extra_args(spec),
            "server": server,
            "tls_sans": tls_sans(ctx.api_address, ctx.master_private_ips),
        }),
    )
}

/// Script installing k3s in agent mode, joining through the first master.
///
/// # Errors
/// Returns an error if rendering fails.
pub fn worker_script(spec: &ClusterSpec, token: &str, first_master_private_ip: &str) -> Result<String> {
    templates::render(
        "worker_script",
        templates::WORKER_SCRIPT,
        &json!({
            "k3s_version": spec.k3s_version,
            "token": token,
            "first_master_private_ip": first_master_private_ip,
        }),
    )
}
