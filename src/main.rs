//! Courier Gateway daemon entry point.
//!
//! Boots the supervisor with one manager from the environment,
//! connects the bus, opens the initial shard group and serves the
//! health endpoints until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{debug, error, info};

use courier_gateway::config::DaemonConfig;
use courier_gateway::dispatch::PassthroughState;
use courier_gateway::health::{self, AppState};
use courier_gateway::metrics::GatewayMetrics;
use courier_gateway::publisher::{ChannelPublisher, NatsPublisher, Publisher};
use courier_gateway::supervisor::Courier;
use courier_gateway::Manager;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get the log level
    let config = DaemonConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("courier_gateway={}", config.log_level).parse()?)
                .add_directive("tungstenite=info".parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        manager = %config.manager.identifier,
        "Starting Courier Gateway"
    );

    let metrics = GatewayMetrics::install();
    info!("Prometheus metrics initialized");

    let courier = Arc::new(Courier::new(config.dispatch_pool_size, metrics.clone()));

    let manager = courier.create_manager(config.manager.clone(), Arc::new(PassthroughState))?;
    let client_name = manager.client_name();

    // Connect the bus, falling back to local mode without one
    let publisher: Arc<dyn Publisher> = if let Some(ref url) = config.nats_url {
        match NatsPublisher::connect(url, &client_name).await {
            Ok(publisher) => {
                info!(url, client_name, "Connected to NATS");
                metrics.set_bus_connected(true);
                publisher
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS");
                return Err(e.into());
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        let (publisher, mut rx) = ChannelPublisher::new();
        tokio::spawn(async move {
            while let Some((channel, payload)) = rx.recv().await {
                debug!(channel, bytes = payload.len(), "Local mode event");
            }
        });
        publisher
    };

    manager.open(publisher);

    let shard_count = manager.gather_shard_count();
    let shard_ids = Manager::generate_shard_ids(shard_count);
    info!(shard_count, shards = shard_ids.len(), "Opening initial shard group");

    let (group_id, _ready) = manager.scale(shard_ids, shard_count, true).await?;
    info!(group_id, "Shard group opening");

    // Health server
    let app_state = AppState {
        courier: Arc::clone(&courier),
    };
    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    info!(port = config.http_port, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let http_server = axum::serve(listener, health_router);

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = courier.token.cancelled() => {
            info!("Supervisor scope cancelled");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down gateway...");
    courier.close().await;
    info!("Gateway shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
