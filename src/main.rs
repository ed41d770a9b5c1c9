//! kysor: keeps a pool validator binary current and running
//!
//! Polls the registry for the version the pool expects, installs it when it
//! is missing and supervises the validator until it reports that it is
//! outdated, then starts over.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kysor::config::{detect_host_target, SupervisorConfig};
use kysor::{Secrets, Shutdown, Supervisor};

#[derive(Parser)]
#[command(name = "kysor")]
#[command(about = "Keeps a pool validator binary up to date and running")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "kysor.toml")]
    config: String,

    /// Pool to validate for (overrides config file)
    #[arg(short, long, env = "KYSOR_POOL_ID")]
    pool_id: Option<String>,

    /// Network chain id (overrides config file)
    #[arg(short, long, env = "KYSOR_NETWORK")]
    network: Option<String>,

    /// Host target key, e.g. linux-x64 (overrides config file)
    #[arg(long, env = "KYSOR_HOST_TARGET")]
    host_target: Option<String>,

    /// Directory holding installed binaries
    #[arg(long, env = "KYSOR_ARTIFACT_DIR")]
    artifact_dir: Option<String>,

    /// Directory holding mnemonic.txt and keyfile.json
    #[arg(long, env = "KYSOR_SECRETS_DIR")]
    secrets_dir: Option<String>,

    /// Registry REST endpoint
    #[arg(long, env = "KYSOR_REGISTRY_ENDPOINT")]
    registry_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kysor=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting kysor ...");
    info!("Config file: {}", cli.config);

    let mut config = match SupervisorConfig::load(std::path::Path::new(&cli.config)) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    // Apply CLI overrides
    if let Some(pool_id) = cli.pool_id {
        config.protocol_node.pool_id = pool_id;
    }
    if let Some(network) = cli.network {
        config.protocol_node.network = network;
    }
    if let Some(host_target) = cli.host_target {
        config.supervisor.host_target = host_target;
    }
    if let Some(artifact_dir) = cli.artifact_dir {
        config.supervisor.artifact_dir = PathBuf::from(artifact_dir);
    }
    if let Some(secrets_dir) = cli.secrets_dir {
        config.supervisor.secrets_dir = PathBuf::from(secrets_dir);
    }
    if let Some(endpoint) = cli.registry_endpoint {
        config.supervisor.registry_endpoint = Some(endpoint);
    }

    // Configuration problems are operator policy, not crashes
    if let Err(e) = config.validate() {
        error!("{}", e);
        if detect_host_target().is_none() {
            error!("Unsupported host, set supervisor.host_target explicitly");
        }
        std::process::exit(e.exit_code());
    }

    info!("Pool: {}", config.protocol_node.pool_id);
    info!("Network: {}", config.protocol_node.network);
    info!("Host target: {}", config.supervisor.host_target);
    info!("Artifact dir: {}", config.supervisor.artifact_dir.display());

    let secrets = match Secrets::load(&config.supervisor.secrets_dir) {
        Ok(secrets) => secrets,
        Err(e) => {
            error!("{}", e);
            std::process::exit(0);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let supervisor = match Supervisor::new(config, secrets, cancel) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    match supervisor.run().await {
        Ok(Shutdown::Cancelled) => info!("Shut down"),
        Ok(Shutdown::ChildExited(status)) => info!(%status, "Validator exited, shut down"),
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }

    Ok(())
}

/// Cancel on Ctrl-C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
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

    info!("Shutdown signal received");
    cancel.cancel();
}
