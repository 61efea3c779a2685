// ABOUTME: Entry point for the imagegw server.
// ABOUTME: Loads configuration, wires the orchestrator, and serves the API until Ctrl-C.

use imagegw::api::{self, Gateway};
use imagegw::config::Config;
use imagegw::error::{Error, Result};
use imagegw::orchestrator::Orchestrator;
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cwd = env::current_dir()?;
    let config = Config::discover(&cwd)?;

    let orchestrator = Arc::new(Orchestrator::from_config(&config).await?);
    let gateway = Arc::new(Gateway::new(Arc::clone(&orchestrator), &config.auth_header)?);
    tracing::info!(
        platforms = ?orchestrator.platforms(),
        store = ?config.store,
        "Gateway ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = config.refresh.sweep_interval.map(|period| {
        let orchestrator = Arc::clone(&orchestrator);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        orchestrator.sweep().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    });

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| Error::Server(format!("failed to bind {}: {}", config.listen, e)))?;
    let server = tokio::spawn(api::serve(listener, gateway, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C, shutting down");
    let _ = shutdown_tx.send(true);

    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    server
        .await
        .map_err(|e| Error::Server(format!("server task failed: {}", e)))?
}
