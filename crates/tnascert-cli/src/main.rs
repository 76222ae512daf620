//! tnascert-deploy - Deploy TLS certificates to TrueNAS appliances

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tnascert_cli::config::{ConfigFile, Target, DEFAULT_CONFIG_FILE, DEFAULT_TARGET};
use tnascert_deploy::{preflight, Deployment};
use tnascert_transport_websocket::WebSocketClient;

/// Import a certificate into TrueNAS and activate it
#[derive(Parser, Debug)]
#[command(name = "tnascert-deploy")]
#[command(about = "Deploy TLS certificates to TrueNAS appliances", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "TNASCERT_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Deploy to every target in the configuration file
    #[arg(long, conflicts_with = "target")]
    all: bool,

    /// Only verify the local certificate and credentials
    #[arg(long)]
    check: bool,

    /// Target to deploy to
    #[arg(default_value = DEFAULT_TARGET)]
    target: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = ConfigFile::load(&cli.config)?;
    debug!("Loaded {} target(s) from {:?}", config.targets.len(), cli.config);

    let targets: Vec<&Target> = if cli.all {
        config.targets.iter().collect()
    } else {
        let target = config.get_target(&cli.target).with_context(|| {
            format!("Target '{}' not found in {:?}", cli.target, cli.config)
        })?;
        vec![target]
    };

    let mut failed = 0;
    for target in &targets {
        let result = if cli.check {
            check_target(&config, target)
        } else {
            deploy_target(&config, target).await
        };

        if let Err(e) = result {
            error!("Target '{}': {:#}", target.name, e);
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} target(s) failed", failed, targets.len());
    }
    Ok(())
}

fn check_target(config: &ConfigFile, target: &Target) -> Result<()> {
    let deploy_config = target.to_deploy_config(&config.defaults)?;
    target.websocket_config(&config.defaults)?;

    let (local, credentials) = preflight(&deploy_config)?;
    info!(
        "Target '{}': certificate {} is valid until {} (chain of {}), logging in with the {}",
        target.name,
        local.info.subject,
        local.info.not_after,
        local.info.chain_len,
        credentials.kind()
    );
    Ok(())
}

async fn deploy_target(config: &ConfigFile, target: &Target) -> Result<()> {
    let deploy_config = target.to_deploy_config(&config.defaults)?;
    let ws_config = target.websocket_config(&config.defaults)?;

    // Fail before connecting if the local files are unusable
    let (local, credentials) = preflight(&deploy_config)?;

    info!(
        "Connecting to {} for target '{}'",
        target.server_url(&config.defaults),
        target.name
    );
    let client = WebSocketClient::connect(&ws_config)
        .await
        .with_context(|| format!("Failed to connect to {}", deploy_config.connect_host))?;

    let report = Deployment::new(&client, deploy_config)
        .with_verified(local, credentials)
        .run()
        .await?;

    info!(
        "Target '{}': {} (id {}) deployed, {} app(s) updated, {} old certificate(s) retired",
        target.name,
        report.certificate_name,
        report.certificate_id,
        report.apps_updated.len(),
        report.retired.len()
    );
    if let Ok(json) = serde_json::to_string_pretty(&report) {
        debug!("Deployment report:\n{}", json);
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
