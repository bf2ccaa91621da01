//! Readiness probing of freshly created servers.
//!
//! A server's first boot installs a crontab entry that writes `true` to
//! `/etc/ready` on every boot. The probe polls for that marker over SSH.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::providers::Server;
use crate::retry::{with_retry_async, RetryConfig};
use crate::ssh::{RemoteError, RemoteExecutor};

/// Command reading the readiness marker.
pub const READY_COMMAND: &str = "cat /etc/ready";

/// Wait until `server` reports its readiness marker.
///
/// Any transport error or unexpected output counts as "not yet ready".
///
/// # Errors
/// Returns [`Error::ReadinessTimeout`] once `policy` is exhausted, or
/// [`Error::Config`] if the server has no public address.
pub async fn await_ready(
    executor: &dyn RemoteExecutor,
    server: &Server,
    policy: &RetryConfig,
) -> Result<()> {
    let address = server
        .public_ipv4
        .as_deref()
        .ok_or_else(|| Error::Config(format!("server {} has no public address", server.name)))?;

    info!(server = %server.name, "Waiting for server to be ready");

    let outcome = with_retry_async(policy, &format!("readiness of {}", server.name), || async {
        let output = executor.probe(address, READY_COMMAND).await?;
        if output.trim() == "true" {
            Ok(())
        } else {
            debug!(server = %server.name, output = %output.trim(), "Readiness marker not set");
            Err(RemoteError::Output("server is not ready".into()))
        }
    })
    .await;

    match outcome {
        Ok(()) => {
            info!(server = %server.name, "Server is ready");
            Ok(())
        }
        Err(e) => Err(Error::ReadinessTimeout {
            server: server.name.clone(),
            attempts: policy.max_attempts,
            last_error: e.to_string(),
        }),
    }
}
