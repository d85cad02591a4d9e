//! Transfer Coordinator - reward transfers confirmed by block callbacks
//!
//! Submits reward contracts to a blockchain node, records each transfer in a
//! status store and holds the caller until the node reports the block as
//! finalized or the wait deadline passes.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod config;
mod coordination;
mod error;
mod metrics;
mod node;
mod state;

use config::Settings;
use coordination::{PendingRegistry, StaleReaper, TransferCoordinator, TransferService};
use metrics::MetricsServer;
use node::HttpNodeClient;
use state::StatusStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Transfer Coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!("Loaded configuration for {} nodes", settings.nodes.len());

    // Initialize status store
    let store = Arc::new(StatusStore::new(&settings.database).await?);
    info!("Status store connection established");

    store.run_migrations().await?;
    info!("Status store migrations complete");

    let registry = Arc::new(PendingRegistry::new());
    let coordinator = Arc::new(TransferCoordinator::new(store.clone(), registry.clone()));

    // Nobody is waiting on rows left pending by a previous process
    coordinator.recover_orphaned().await?;

    // Start stale-entry reaper
    let reaper = Arc::new(StaleReaper::new(
        registry.clone(),
        settings.coordinator.pending_ttl(),
        settings.coordinator.reap_interval(),
    ));
    let reaper_handle = reaper.clone().start();

    let node_client = Arc::new(HttpNodeClient::new(&settings.node_client)?);
    let service = Arc::new(TransferService::new(
        coordinator.clone(),
        node_client,
        Arc::new(settings.nodes.clone()),
        settings.coordinator.clone(),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.server.clone();
        let state = api::AppState {
            coordinator: coordinator.clone(),
            service,
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let registry = registry.clone();
        let interval = settings.coordinator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                match store.health_check().await {
                    Ok(()) => metrics::record_health_check(),
                    Err(e) => {
                        warn!("Status store health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }

                metrics::set_pending_rendezvous(registry.len().await);
            }
        }
    });

    info!("Transfer Coordinator is running");
    info!(
        "API server: http://{}:{}",
        settings.server.host, settings.server.port
    );
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    reaper.stop().await;

    api_handle.abort();
    reaper_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Transfer Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,transfer_coordinator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
