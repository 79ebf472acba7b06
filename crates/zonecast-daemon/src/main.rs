//! Zonecast daemon — the `WebSocket` event distribution service.
//!
//! Loads the gateway configuration, seeds the principal store, and runs
//! the listener until interrupted.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zonecast_core::{InMemoryPrincipalStore, PrincipalStore};
use zonecast_gateway::{GatewayConfig, GatewayServer};

/// Zonecast event distribution daemon.
#[derive(Debug, Parser)]
#[command(name = "zonecastd", version, about)]
struct Args {
    /// Path to the gateway configuration file.
    #[arg(short, long, env = "ZONECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long, env = "ZONECAST_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,zonecast=info,zonecastd=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::load_default()?,
    };
    if let Some(bind) = args.bind {
        config.listener.bind_addr = bind;
    }

    let store = InMemoryPrincipalStore::new().shared();
    seed_principals(&config, &store).await?;

    let server = Arc::new(GatewayServer::build(
        &config,
        store as Arc<dyn PrincipalStore>,
    )?);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(Arc::clone(&server).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(());
    handle.await??;

    Ok(())
}

/// Load configured accounts into the principal store.
async fn seed_principals(
    config: &GatewayConfig,
    store: &Arc<InMemoryPrincipalStore>,
) -> anyhow::Result<()> {
    if config.principals.is_empty() {
        warn!("no principals configured, only claims-fallback logins can connect");
        return Ok(());
    }
    for seed in &config.principals {
        let principal = seed.to_principal();
        info!(username = %principal.username, admin = principal.admin, "seeded principal");
        store.upsert(principal).await?;
    }
    Ok(())
}
