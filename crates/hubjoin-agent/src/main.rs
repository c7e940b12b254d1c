//! hubjoin Agent
//!
//! Bootstraps a managed cluster's connection to its hub.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hubjoin_agent::{Agent, AgentConfig, AgentOutcome, CaCache, DirSecretSource, HttpHubClient};

/// hubjoin agent: obtain a durable hub credential.
#[derive(Parser, Debug)]
#[command(name = "hubjoin-agent", about = "Join a managed cluster to its hub")]
struct Args {
    /// Path to the agent configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Root of the mounted secrets tree
    #[arg(long)]
    secrets_dir: Option<PathBuf>,

    /// Directory holding the durable credential
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Managed cluster name
    #[arg(long)]
    cluster_name: Option<String>,

    /// Agent instance name
    #[arg(long)]
    agent_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn load_config(&self) -> Result<AgentConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)?,
            None => AgentConfig::default(),
        };

        if let Some(dir) = &self.secrets_dir {
            config.secrets_dir = dir.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(name) = &self.cluster_name {
            config.cluster_name = name.clone();
        }
        if let Some(name) = &self.agent_name {
            config.agent_name = name.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(format!(
                    "hubjoin_agent={0},hubjoin_core={0}",
                    args.log_level
                ))
            }),
        )
        .with_target(true)
        .init();

    let config = args.load_config()?;

    info!(
        cluster = %config.cluster_name,
        agent = %config.agent_name,
        bootstrap = ?config.bootstrap.kind,
        "Starting hubjoin agent"
    );

    let ca = Arc::new(CaCache::new(config.hub_ca_file.clone()));
    let source = DirSecretSource::new(&config.secrets_dir);
    let hub = HttpHubClient::new(ca.clone());
    let agent = Agent::new(config, source, hub, ca)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match agent.run(&cancel).await {
        Ok(AgentOutcome::AlreadyBootstrapped(record)) => {
            info!(expires_at = %record.credential.expires_at, "Hub credential already in place");
            Ok(())
        }
        Ok(AgentOutcome::Bootstrapped(record)) => {
            info!(
                source = %record.credential.source_ref,
                request_id = %record.credential.request_id,
                expires_at = %record.credential.expires_at,
                "Joined hub"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Bootstrap failed");
            Err(e.into())
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown requested");
    token.cancel();
}
