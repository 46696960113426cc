//! Purge Relay
//!
//! # Usage
//! ```bash
//! # EC2 instances tagged machinetype=varnish and env=prod
//! purge-relay --port 8000 --destport 6081 aws machinetype:varnish env:prod
//!
//! # GCE instances named varnish-* in europe-west1
//! purge-relay gce --project my-project --region europe-west1 --name-prefix varnish
//!
//! # Fixed fleet
//! purge-relay static --backend 10.0.0.1 --backend 10.0.0.2:6081
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use purge_relay::config::{Cli, LogFormat, RelayConfig};
use purge_relay::directory::BackendDirectory;
use purge_relay::discovery::build_provider;
use purge_relay::error::DiscoveryError;
use purge_relay::server::{self, RelayState};

fn init_logging(cli: &Cli) -> Result<()> {
    let default_directives = if cli.debug {
        "purge_relay=debug,tower_http=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    match cli.log_format {
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = RelayConfig::try_from(&cli).context("Invalid configuration")?;
    info!(
        listen = %config.listen_addr,
        destination_port = config.destination_port,
        cache_ttl_secs = config.directory_ttl.as_secs(),
        budget_secs = config.overall_budget.as_secs(),
        "Starting purge relay"
    );

    let provider = build_provider(&cli.provider)?;
    provider
        .authenticate()
        .await
        .map_err(|source| DiscoveryError::Authentication {
            provider: provider.name(),
            source,
        })?;

    let directory = Arc::new(BackendDirectory::new(provider, config.directory_ttl));
    directory.warm_up().await;

    let state = RelayState::from_config(&config, directory)?;
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    server::serve(listener, state).await
}
