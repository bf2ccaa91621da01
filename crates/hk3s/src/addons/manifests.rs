//! Addon payloads.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use serde_json::json;

use crate::config::ClusterSpec;
use crate::error::{Error, Result};
use crate::k3s::scripts;
use crate::naming;
use crate::provision;
use crate::templates;

/// Hetzner cloud controller manager, networks flavour.
pub const CCM_URL: &str = "https://github.com/hetznercloud/hcloud-cloud-controller-manager/releases/latest/download/ccm-networks.yaml";

/// Hetzner CSI driver.
pub const CSI_URL: &str =
    "https://raw.githubusercontent.com/hetznercloud/csi-driver/master/deploy/kubernetes/hcloud-csi.yml";

/// Rancher system upgrade controller.
pub const UPGRADE_CONTROLLER_URL: &str = "https://github.com/rancher/system-upgrade-controller/releases/download/v0.9.1/system-upgrade-controller.yaml";

pub const CCM_SECRET_NAME: &str = "hcloud";
pub const CSI_SECRET_NAME: &str = "hcloud-csi";
pub const AUTOSCALER_SECRET_NAME: &str = "hcloud-cluster-autoscaler";

const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

fn secret(name: &str, data: &BTreeMap<&str, &str>) -> Result<String> {
    templates::render(
        "secret",
        templates::SECRET,
        &json!({ "name": name, "data": data }),
    )
}

/// Secret read by the cloud controller manager.
///
/// # Errors
/// Returns an error if rendering fails.
pub fn ccm_secret(spec: &ClusterSpec) -> Result<String> {
    secret(
        CCM_SECRET_NAME,
        &BTreeMap::from([
            ("network", spec.network_name()),
            ("token", spec.hetzner_token.as_str()),
        ]),
    )
}

/// Secret read by the CSI driver.
///
/// # Errors
/// Returns an error if rendering fails.
pub fn csi_secret(spec: &ClusterSpec) -> Result<String> {
    secret(
        CSI_SECRET_NAME,
        &BTreeMap::from([("token", spec.hetzner_token.as_str())]),
    )
}

/// Secret read by the cluster autoscaler.
///
/// # Errors
/// Returns an error if rendering fails.
pub fn autoscaler_secret(spec: &ClusterSpec) -> Result<String> {
    secret(
        AUTOSCALER_SECRET_NAME,
        &BTreeMap::from([("token", spec.hetzner_token.as_str())]),
    )
}

/// Upstream CSI manifest, with the volume class demoted unless it should
/// be the default storage class.
///
/// # Errors
/// Returns an error if the annotation pattern cannot be compiled.
pub fn csi_driver(upstream: &str, default_class: bool) -> Result<String> {
    if default_class {
        return Ok(upstream.to_string());
    }
    let annotation = Regex::new(&format!("{}.*", regex::escape(DEFAULT_CLASS_ANNOTATION)))
        .map_err(|e| Error::Config(format!("invalid annotation pattern: {e}")))?;
    Ok(annotation
        .replace_all(upstream, format!("{DEFAULT_CLASS_ANNOTATION}: \"false\""))
        .into_owned())
}

/// `--nodes` flag per autoscaling pool.
#[must_use]
pub fn autoscaler_node_pools(spec: &ClusterSpec) -> Vec<String> {
    spec.autoscaling_node_pools
        .iter()
        .map(|pool| {
            format!(
                "--nodes={}:{}:{}:{}:{}",
                pool.instance_min,
                pool.instance_max,
                pool.instance_type.to_uppercase(),
                spec.pool_location(pool.location.as_deref()).to_uppercase(),
                naming::autoscaler_group(&spec.cluster_name, &pool.instance_type, &pool.name),
            )
        })
        .collect()
}

/// Operator autoscaler flags, logging to stderr at info unless set.
#[must_use]
pub fn autoscaler_args(spec: &ClusterSpec) -> Vec<String> {
    let mut args = spec.cluster_autoscaler_args.clone();
    if !args.iter().any(|a| a.contains("--stderrthreshold")) {
        args.push("--stderrthreshold=info".to_string());
    }
    args
}

/// Base64 cloud-init that turns a fresh autoscaled server into a worker.
///
/// # Errors
/// Returns an error if rendering fails.
pub fn autoscaler_cloud_init(
    spec: &ClusterSpec,
    token: &str,
    first_master_private_ip: &str,
) -> Result<String> {
    let join = scripts::worker_script(spec, token, first_master_private_ip)?;
    let document = provision::cloud_init(spec, Some(&join))?;
    Ok(STANDARD.encode(document))
}

/// Autoscaler RBAC and deployment.
///
/// # Errors
/// Returns an error if rendering fails.
pub fn autoscaler(spec: &ClusterSpec, token: &str, first_master_private_ip: &str) -> Result<String> {
    let args: Vec<String> = autoscaler_args(spec)
        .into_iter()
        .chain(autoscaler_node_pools(spec))
        .collect();

    templates::render(
        "autoscaler",
        templates::AUTOSCALER,
        &json!({
            "version": spec.cluster_autoscaler_version,
            "args": args,
            "cloud_init": autoscaler_cloud_init(spec, token, first_master_private_ip)?,
            "image": spec.image,
            "firewall": spec.cluster_name,
            "ssh_key": spec.cluster_name,
            "network": spec.network_name(),
        }),
    )
}
