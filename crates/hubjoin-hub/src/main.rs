//! hubjoin Reference Hub

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hubjoin_hub::{generate_bootstrap_token, load_ca, serve, HubConfig, HubState};

/// hubjoin hub - liveness and certificate signing endpoints
#[derive(Parser)]
#[command(name = "hubjoin-hub")]
#[command(about = "Reference hub for hubjoin agents", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub API
    Serve(ServeArgs),

    /// Generate a bootstrap token and print it with its SHA-256 hash
    Token,
}

#[derive(Args)]
struct ServeArgs {
    /// HTTP bind address
    #[arg(long, default_value = "127.0.0.1:8443")]
    bind: String,

    /// CA certificate (PEM). A CA is generated when omitted.
    #[arg(long, requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// CA private key (PEM)
    #[arg(long, requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Sign CSRs on submission
    #[arg(long)]
    auto_approve: bool,

    /// Seconds a CSR may stay pending before it expires
    #[arg(long, default_value_t = 3600)]
    csr_ttl_secs: u64,

    /// Seconds a decided CSR stays queryable before it is dropped
    #[arg(long, default_value_t = 86400)]
    retention_secs: u64,

    /// Validity of issued certificates in days
    #[arg(long, default_value_t = 365, value_parser = clap::value_parser!(u32).range(1..))]
    cert_validity_days: u32,

    /// SHA-256 hash of an accepted bootstrap token (repeatable)
    #[arg(long = "token-hash")]
    token_hashes: Vec<String>,

    /// SHA-256 hash of the operator token for approve/deny
    #[arg(long)]
    admin_token_hash: Option<String>,
}

impl From<ServeArgs> for HubConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            bind_addr: args.bind,
            ca_cert_path: args.ca_cert,
            ca_key_path: args.ca_key,
            auto_approve: args.auto_approve,
            csr_ttl_secs: args.csr_ttl_secs,
            retention_secs: args.retention_secs,
            cert_validity_days: args.cert_validity_days,
            token_hashes: args.token_hashes,
            admin_token_hash: args.admin_token_hash,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Token => {
            let (plaintext, token_hash) = generate_bootstrap_token();
            println!("token: {}", plaintext);
            println!("hash:  {}", token_hash);
            Ok(())
        }
        Commands::Serve(args) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                        EnvFilter::new(format!(
                            "hubjoin_hub={0},tower_http={0}",
                            cli.log_level
                        ))
                    }),
                )
                .with_target(true)
                .init();

            run(args.into()).await
        }
    }
}

async fn run(config: HubConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.token_hashes.is_empty() {
        return Err("at least one --token-hash is required".into());
    }

    let ca = load_ca(&config)?;
    let state = HubState::new(ca, &config);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        auto_approve = config.auto_approve,
        tokens = config.token_hashes.len(),
        "hubjoin hub listening"
    );

    if let Err(e) = serve(listener, state, shutdown_signal()).await {
        error!(error = %e, "HTTP server error");
        return Err(e.into());
    }

    info!("Hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
