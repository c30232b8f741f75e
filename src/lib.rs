use anyhow::Result;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod admin;
pub mod bridge;
pub mod config;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod kafka;
pub mod metrics;
pub mod utils;

use admin::{AdminState, run_http_server};
use bridge::NotificationBridge;
use config::Config;
use hub::{Hub, run_websocket_server};
use kafka::EventBus;

pub async fn run() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(service = %config.service_name, "Starting messaging substrate");

    let shutdown = CancellationToken::new();

    let (hub, hub_handle) = Hub::new(&config.hub, config.logging.clone());
    let hub_task = tokio::spawn(hub.run(shutdown.child_token()));

    let bus = if config.kafka.enabled {
        let bus = Arc::new(EventBus::kafka(&config.service_name, &config.kafka));
        if let Some(topic) = &config.kafka.notification_topic {
            bus.subscribe(topic, NotificationBridge::new(hub_handle.clone()))
                .await?;
        }
        Some(bus)
    } else {
        tracing::info!("Event bus disabled (KAFKA_ENABLED=false)");
        None
    };

    // WebSocket listener
    let ws_address = format!("{}:{}", config.bind_address, config.port);
    let ws_listener = TcpListener::bind(&ws_address).await?;

    // Admin listener
    let http_address = format!("{}:{}", config.bind_address, config.health_port);
    let http_listener = TcpListener::bind(&http_address).await?;

    let websocket_server = run_websocket_server(
        ws_listener,
        hub_handle.clone(),
        config.hub.clone(),
        config.logging.clone(),
        shutdown.child_token(),
    );
    let http_server = run_http_server(
        http_listener,
        AdminState {
            hub: hub_handle,
            bus: bus.clone(),
        },
        shutdown.child_token(),
    );

    tokio::select! {
        _ = websocket_server => {
            tracing::info!("WebSocket server shut down.");
        },
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server failed: {}", e);
            }
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Shutdown signal received. Shutting down...");
        }
    }

    shutdown.cancel();

    if let Some(bus) = bus {
        if let Err(e) = bus.close().await {
            tracing::error!("Event bus did not close cleanly: {}", e);
        }
    }

    if let Err(e) = hub_task.await {
        tracing::error!("Connection hub task failed: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
