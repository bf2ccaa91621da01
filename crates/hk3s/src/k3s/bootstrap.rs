//! Ordered k3s installation across the cluster.
//!
//! | Stage | Nodes | Runs after |
//! |---|---|---|
//! | first master | `masters[0]`, cluster-init | - |
//! | kubeconfig | read from the first master | first master |
//! | other masters | concurrently | kubeconfig |
//! | workers | concurrently | every master |
//!
//! Within a stage the first failure aborts the stage's remaining tasks
//! and no later stage starts. Nodes that already joined are left as they
//! are.

use std::sync::Arc;

use rand::RngCore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::scripts::{self, MasterContext};
use crate::error::{Error, Result};
use crate::kubeconfig;
use crate::providers::Server;
use crate::ssh::RemoteExecutor;
use crate::state::ClusterState;
use crate::tasks::{cancellable, join_fail_fast};

/// Prints the node token of a server, or nothing if k3s is not installed.
pub const TOKEN_COMMAND: &str =
    "{ TOKEN=$(< /var/lib/rancher/k3s/server/node-token); } 2> /dev/null; echo $TOKEN";

/// Length of a generated token.
pub const TOKEN_LENGTH: usize = 32;

/// Extract the join secret from `node-token` output.
///
/// The file holds `K10<hash>::server:<secret>`; only the part after the
/// last `:` is the secret. Empty output means no token exists yet.
#[must_use]
pub fn parse_token(output: &str) -> Option<String> {
    let token = output.trim();
    if token.is_empty() {
        return None;
    }
    token.rsplit(':').next().map(str::to_string)
}

/// Fresh random hex token.
#[must_use]
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_LENGTH];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut token = hex::encode(bytes);
    token.truncate(TOKEN_LENGTH);
    token
}

fn public_address(server: &Server) -> Result<String> {
    server
        .public_ipv4
        .clone()
        .ok_or_else(|| Error::Config(format!("server {} has no public address", server.name)))
}

fn private_address(server: &Server) -> Result<String> {
    server
        .private_ipv4
        .clone()
        .ok_or_else(|| Error::Config(format!("server {} has no private address", server.name)))
}

/// Runs the bootstrap stages against the servers in the cluster state.
pub struct Bootstrapper {
    state: Arc<ClusterState>,
    executor: Arc<dyn RemoteExecutor>,
    cancel: CancellationToken,
}

impl Bootstrapper {
    pub fn new(
        state: Arc<ClusterState>,
        executor: Arc<dyn RemoteExecutor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            executor,
            cancel,
        }
    }

    /// Join token for this run.
    ///
    /// Read from the first master when k3s already runs there, generated
    /// otherwise, then cached for the rest of the run.
    ///
    /// # Errors
    /// Returns an error if the cluster has no first master.
    pub async fn token(&self) -> Result<String> {
        let inventory = self.state.resolve_servers().await?;
        let first = inventory.first_master()?;
        let address = public_address(first)?;
        let name = first.name.clone();

        let token = self
            .state
            .resolve_token(|| async {
                match self.executor.run(&address, TOKEN_COMMAND).await {
                    Ok(output) => Ok(parse_token(&output).unwrap_or_else(|| {
                        info!(server = %name, "No existing token, generating one");
                        random_token()
                    })),
                    Err(e) => {
                        warn!(server = %name, error = %e, "Cannot read token from first master, generating one");
                        Ok(random_token())
                    }
                }
            })
            .await?;
        Ok(token.to_string())
    }

    /// Install k3s on every server, stage by stage.
    ///
    /// # Errors
    /// Returns the first failure; later stages do not run.
    pub async fn deploy(&self) -> Result<()> {
        let spec = self.state.spec().clone();
        let inventory = self.state.resolve_servers().await?;
        let masters = self.with_addresses(&inventory.masters).await?;
        let workers = self.with_addresses(&inventory.workers).await?;
        let first = masters
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("cluster has no master servers".into()))?;

        let token = self.token().await?;
        let api_address = self.state.api_address().await?;
        let master_private_ips = masters
            .iter()
            .map(private_address)
            .collect::<Result<Vec<_>>>()?;
        let first_master_private_ip = private_address(&first)?;

        let ctx = MasterContext {
            token: &token,
            api_address: &api_address,
            master_private_ips: &master_private_ips,
        };

        // First master
        let script = scripts::master_script(&spec, &ctx, true)?;
        cancellable(
            &self.cancel,
            run_script(self.executor.as_ref(), &first, "first master", &script),
        )
        .await?;

        // Kubeconfig
        let first_address = public_address(&first)?;
        cancellable(
            &self.cancel,
            kubeconfig::save(
                self.executor.as_ref(),
                &first_address,
                &api_address,
                &spec.cluster_name,
                &spec.kubeconfig_path(),
            ),
        )
        .await?;

        // Other masters
        if masters.len() > 1 {
            let script = scripts::master_script(&spec, &ctx, false)?;
            let set = self.spawn_stage(&masters[1..], "master", &script);
            join_fail_fast(set).await?;
        }

        // Workers
        if !workers.is_empty() {
            let script = scripts::worker_script(&spec, &token, &first_master_private_ip)?;
            let set = self.spawn_stage(&workers, "worker", &script);
            join_fail_fast(set).await?;
        }

        info!(
            masters = masters.len(),
            workers = workers.len(),
            "k3s deployed to every node"
        );
        Ok(())
    }

    /// Re-read servers whose addresses were not known at creation time.
    async fn with_addresses(&self, servers: &[Server]) -> Result<Vec<Server>> {
        let reconciler = self.state.reconciler();
        let mut resolved = Vec::with_capacity(servers.len());
        for server in servers {
            resolved.push(reconciler.refresh_server(server.clone()).await?);
        }
        Ok(resolved)
    }

    fn spawn_stage(&self, servers: &[Server], role: &'static str, script: &str) -> JoinSet<Result<()>> {
        let mut set = JoinSet::new();
        for server in servers {
            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            let server = server.clone();
            let script = script.to_string();
            set.spawn(async move {
                cancellable(&cancel, run_script(executor.as_ref(), &server, role, &script)).await
            });
        }
        set
    }
}

async fn run_script(
    executor: &dyn RemoteExecutor,
    server: &Server,
    role: &str,
    script: &str,
) -> Result<()> {
    let address = public_address(server)?;
    info!(server = %server.name, role, "Deploying k3s");
    executor
        .run(&address, script)
        .await
        .map_err(|e| Error::remote(&address, e))?;
    info!(server = %server.name, role, "k3s deployed");
    Ok(())
}
