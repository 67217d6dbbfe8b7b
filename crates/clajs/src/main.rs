#![forbid(unsafe_code)]

use anyhow::Result;
use clajs::blacklist::Blacklist;
use clajs::config::{Args, ServerConfig};
use clajs::metrics::{start_metrics_server, HealthState};
use clajs::run_with_shutdown;
use clajs::server::ServerState;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let blacklist = Arc::new(Blacklist::new(config.blocked_nets()?));
    if !config.block.is_empty() {
        info!(count = config.block.len(), "loaded static blacklist entries");
    }
    if let Some(url) = &config.blacklist_url {
        blacklist.refresh_logged(url).await;
        if config.blacklist_refresh > 0 {
            Arc::clone(&blacklist).spawn_refresh(
                url.clone(),
                Duration::from_secs(config.blacklist_refresh),
            );
        }
    }

    let state = Arc::new(ServerState::new(config.clone(), blacklist));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();
    if let Some(metrics_addr) = config.metrics_addr {
        tokio::spawn({
            let health_state = health_state.clone();
            async move {
                if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                    warn!("metrics server error: {}", e);
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));
    health_state.set_ready(true);

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    drop(shutdown_tx);

    if let Err(e) = server.await? {
        tracing::error!("server error: {}", e);
    }
    Ok(())
}
