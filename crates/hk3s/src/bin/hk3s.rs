//! hk3s CLI - k3s clusters on Hetzner Cloud.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hk3s::addons::KubectlApplier;
use hk3s::providers::hetzner::HetznerCloud;
use hk3s::releases::ReleaseClient;
use hk3s::ssh::SshExecutor;
use hk3s::{Cluster, ClusterSpec, Error};

/// Exit code after Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

/// hk3s - create, upgrade and delete k3s clusters on Hetzner Cloud.
#[derive(Parser)]
#[command(name = "hk3s", version)]
#[command(about = "Create, upgrade and delete k3s clusters on Hetzner Cloud")]
struct Cli {
    /// Cluster configuration file.
    #[arg(short, long, global = true, default_value = "cluster_config.yaml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Skip confirmations and trust unknown SSH host keys.
    #[arg(long, global = true)]
    auto_approve: bool,

    /// Hetzner Cloud token (overrides the configuration file).
    #[arg(long, global = true, env = "HCLOUD_TOKEN", hide_env_values = true)]
    hcloud_token: Option<String>,

    /// GitHub token for listing releases.
    #[arg(long, global = true, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the cluster, or finish creating it.
    CreateCluster,

    /// Delete every resource of the cluster.
    DeleteCluster,

    /// Upgrade k3s on every node.
    UpgradeCluster {
        /// Target version; defaults to `k3s_version` from the configuration.
        #[arg(long)]
        new_k3s_version: Option<String>,
    },

    /// List the servers of the cluster.
    ListServers,

    /// List available k3s releases.
    Releases {
        /// Only releases matching this regex.
        #[arg(long)]
        filter: Option<String>,

        /// Only the newest matching release.
        #[arg(long)]
        latest: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("info,hk3s=debug")
    } else {
        EnvFilter::new("warn,hk3s=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            interrupt.cancel();
        }
    });

    match run(cli, cancel.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if cancel.is_cancelled() || is_cancelled(&e) => {
            error!("Cancelled");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn is_cancelled(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled))
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    match &cli.command {
        Commands::Releases { filter, latest } => {
            let releases = ReleaseClient::new(cli.github_token.clone())?
                .available(filter.as_deref(), *latest)
                .await?;
            for release in releases {
                println!("{release}");
            }
        }

        Commands::CreateCluster => {
            let (_, cluster) = build_cluster(&cli, cancel)?;
            cluster.create().await?;
        }

        Commands::DeleteCluster => {
            let (spec, cluster) = build_cluster(&cli, cancel)?;
            if !cli.auto_approve && !confirm_delete(&spec.cluster_name)? {
                info!("Aborted");
                return Ok(());
            }
            let report = cluster.delete().await?;
            for (resource, reason) in &report.failed {
                warn!(resource = %resource, reason = %reason, "Not deleted");
            }
            info!(
                cluster = %spec.cluster_name,
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Cluster deleted"
            );
        }

        Commands::UpgradeCluster { new_k3s_version } => {
            let (_, cluster) = build_cluster(&cli, cancel)?;
            cluster.upgrade(new_k3s_version.as_deref()).await?;
        }

        Commands::ListServers => {
            let (_, cluster) = build_cluster(&cli, cancel)?;
            let servers = cluster.list_servers().await?;
            println!(
                "{:<45} {:<10} {:<16} {:<16} {:<8} {:<8}",
                "NAME", "STATUS", "PUBLIC IP", "PRIVATE IP", "TYPE", "LOCATION"
            );
            println!("{}", "-".repeat(108));
            for server in servers {
                println!(
                    "{:<45} {:<10} {:<16} {:<16} {:<8} {:<8}",
                    server.name,
                    server.status,
                    server.public_ipv4.unwrap_or_default(),
                    server.private_ipv4.unwrap_or_default(),
                    server.server_type,
                    server.location
                );
            }
        }
    }

    Ok(())
}

fn build_cluster(cli: &Cli, cancel: CancellationToken) -> Result<(Arc<ClusterSpec>, Cluster)> {
    let spec = load_spec(cli)?;
    let provider = Arc::new(
        HetznerCloud::new(&spec.hetzner_token).context("Failed to create Hetzner provider")?,
    );
    let executor = Arc::new(SshExecutor::new(&spec, cli.auto_approve));
    let applier = Arc::new(KubectlApplier::new(spec.kubeconfig_path()));
    let cluster = Cluster::new(spec.clone(), provider, executor, applier, cancel)?
        .with_releases(ReleaseClient::new(cli.github_token.clone())?);
    Ok((spec, cluster))
}

fn load_spec(cli: &Cli) -> Result<Arc<ClusterSpec>> {
    let mut spec = ClusterSpec::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(token) = cli.hcloud_token.as_ref().filter(|t| !t.is_empty()) {
        spec.hetzner_token.clone_from(token);
    }
    if spec.hetzner_token.is_empty() {
        bail!("No Hetzner token: set hetzner_token in the configuration or HCLOUD_TOKEN");
    }
    Ok(Arc::new(spec))
}

fn confirm_delete(cluster: &str) -> Result<bool> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Delete cluster {cluster} and all its resources?"))
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}
