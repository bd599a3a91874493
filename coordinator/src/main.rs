use axum::{routing::get, Router};
use coordinator::clock::SystemClock;
use coordinator::config::{Config, StoreKind};
use coordinator::publish::MqttPublisher;
use coordinator::store::{MemoryStore, Store};
use coordinator::{db, metrics, rest, sweeper, Coordinator};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting device coordinator");
    info!("HTTP server: {}", config.http_addr);
    info!("Live feed: {}:{}", config.mqtt_broker, config.mqtt_port);

    // Initialize metrics
    metrics::init_metrics();

    let store: Arc<dyn Store> = match config.store {
        StoreKind::Postgres => {
            info!(
                "Database: {}",
                config.database_url.split('@').last().unwrap_or("***")
            );
            let pool = db::make_pool(&config.database_url).await?;
            Arc::new(db::PgStore::new(pool))
        }
        StoreKind::Memory => {
            info!("Using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let client_id = format!("coordinator-{}", uuid::Uuid::new_v4());
    let (publisher, mqtt_handle) = MqttPublisher::connect(
        &config.mqtt_broker,
        config.mqtt_port,
        client_id,
        config.live_topic_prefix.clone(),
    );

    let coordinator = Arc::new(Coordinator::new(
        store,
        Arc::new(publisher),
        Arc::new(SystemClock),
        &config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = tokio::spawn(sweeper::run_sweeper(
        coordinator.clone(),
        config.sweep_interval_ms,
        shutdown_rx.clone(),
    ));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .merge(rest::create_router(coordinator));

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HTTP server listening on {}", config.http_addr);

    let mut server_shutdown = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("Live feed task terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;
    let _ = server_handle.await;

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
