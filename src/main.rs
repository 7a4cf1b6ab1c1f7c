//! Market Pulse - streaming price-feed client
//!
//! Connects to the price feed, keeps the rolling history in sync for the
//! configured instrument and publishes indicator snapshots to other system
//! components.

use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_pulse::{
    health, AppState, Config, ConnectionManager, ConnectionSettings, CoordinatorSettings,
    HttpHistorySource, IndicatorThresholds, Metrics, Publisher, SignalAggregator, SyncCoordinator,
    WebSocketClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Market Pulse feed client");

    let config = Arc::new(Config::load()?);
    info!(
        symbol = %config.symbol,
        ws = %config.ws_endpoint,
        rest = %config.rest_endpoint,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new()?);

    let (manager, connection, connection_events) = ConnectionManager::new(
        WebSocketClient::new(&config.ws_endpoint),
        ConnectionSettings::from_config(&config),
        metrics.clone(),
    );

    let source = Arc::new(HttpHistorySource::new(&config.rest_endpoint)?);
    let aggregator = Arc::new(SignalAggregator::new(
        &config.symbol,
        IndicatorThresholds::default(),
    ));

    let (coordinator, coordinator_handle) = SyncCoordinator::new(
        CoordinatorSettings::from_config(&config),
        source,
        connection.clone(),
        connection_events,
        aggregator.clone(),
        metrics.clone(),
    );

    // Forward core events over IPC
    let publisher = Publisher::new(&config.ipc_socket_path).await;
    tokio::spawn(publisher.run(coordinator_handle.subscribe()));

    let state = Arc::new(AppState {
        config: config.clone(),
        connection: connection.clone(),
        coordinator: coordinator_handle.clone(),
        reports: aggregator.subscribe(),
        metrics: metrics.clone(),
    });

    // Start health check server
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(state, health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    let connection_task = tokio::spawn(manager.run());
    let coordinator_task = tokio::spawn(coordinator.run());

    connection.connect().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    // either task may already be gone once the other stops
    if let Err(e) = connection.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    let _ = connection.shutdown().await;
    let _ = coordinator_handle.shutdown().await;

    coordinator_task.await?;
    connection_task.await?;

    info!("Market Pulse stopped");
    Ok(())
}
