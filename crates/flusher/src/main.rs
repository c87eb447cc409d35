//! Flusher entry point: the background worker draining write-behind
//! queues into the relational store.

use anyhow::Result;
use common::config::FlusherConfig;
use flusher::{GroupFlusher, MessageFlusher};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::mysql::MySqlPoolOptions;
use std::time::Duration;
use store::Store;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = FlusherConfig::from_env();
    info!("starting flusher");
    info!("  redis: {}", cfg.redis_url);
    info!(
        "  flush intervals: groups {:?}, messages {:?}",
        cfg.group_flush_interval, cfg.message_flush_interval
    );

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], cfg.metrics_port))
        .install()
        .expect("failed to start Prometheus exporter");
    info!("metrics listening on port {}", cfg.metrics_port);

    let store = Store::connect(&cfg.redis_url)?;
    store.ping().await?;
    info!("connected to store");

    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(3))
        .connect(&cfg.database_url)
        .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("connected to database");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let groups = GroupFlusher::new(store.clone(), pool.clone(), cfg.clone());
    let messages = MessageFlusher::new(store, pool, cfg);
    let group_handle = tokio::spawn(groups.run(shutdown_rx.clone()));
    let message_handle = tokio::spawn(messages.run(shutdown_rx));

    shutdown_signal().await;
    info!("shutting down flushers...");
    let _ = shutdown_tx.send(true);
    let _ = group_handle.await;
    let _ = message_handle.await;

    info!("flusher stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
