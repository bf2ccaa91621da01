//! In-place upgrades through the system upgrade controller.
//!
//! The controller watches `Plan` objects; applying the server plan and
//! then the agent plan rolls every node to the target version.

use serde_json::json;
use tracing::info;

use crate::addons::ManifestApplier;
use crate::error::{Error, Result};
use crate::templates;

/// Agent plan concurrency: all workers but one, at least one.
#[must_use]
pub fn agent_concurrency(workers: usize) -> usize {
    workers.saturating_sub(1).max(1)
}

/// Plan upgrading the masters one at a time.
///
/// # Errors
/// Returns an error if rendering fails.
pub fn server_plan(version: &str) -> Result<String> {
    templates::render(
        "upgrade_plan",
        templates::UPGRADE_PLAN,
        &json!({
            "name": "k3s-server",
            "role": "server",
            "concurrency": 1,
            "version": version,
            "operator": "In",
            "server": true,
        }),
    )
}

/// Plan upgrading the workers once the masters are done.
///
/// # Errors
/// Returns an error if rendering fails.
pub fn agent_plan(version: &str, workers: usize) -> Result<String> {
    templates::render(
        "upgrade_plan",
        templates::UPGRADE_PLAN,
        &json!({
            "name": "k3s-agent",
            "role": "agent",
            "concurrency": agent_concurrency(workers),
            "version": version,
            "operator": "NotIn",
            "server": false,
        }),
    )
}

/// Apply the server plan, then the agent plan.
///
/// # Errors
/// Returns [`Error::Manifest`] for the first plan that cannot be applied;
/// the agent plan is not applied if the server plan fails.
pub async fn apply_plans(
    applier: &dyn ManifestApplier,
    version: &str,
    workers: usize,
) -> Result<()> {
    let fail = |step: &str, e: crate::addons::ApplyError| Error::Manifest {
        step: step.to_string(),
        message: e.to_string(),
    };

    applier
        .apply(&server_plan(version)?)
        .await
        .map_err(|e| fail("upgrade k3s servers", e))?;
    applier
        .apply(&agent_plan(version, workers)?)
        .await
        .map_err(|e| fail("upgrade k3s agents", e))?;

    info!(version, "Upgrade plans applied; nodes will be upgraded by the system upgrade controller");
    Ok(())
}
