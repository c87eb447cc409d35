//! Registry service entry point.

use anyhow::Result;
use common::config::RegistryConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use registry::{create_router, AppState};
use std::net::SocketAddr;
use store::Store;
use tokio::net::TcpListener;
use tokio::signal;
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

    let cfg = RegistryConfig::from_env();
    info!("starting registry service");
    info!("  http port: {}", cfg.http_port);
    info!("  redis: {}", cfg.redis_url);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], cfg.metrics_port))
        .install()
        .expect("failed to start Prometheus exporter");
    info!("metrics listening on port {}", cfg.metrics_port);

    let store = Store::connect(&cfg.redis_url)?;
    store.ping().await?;
    info!("connected to store");

    let state = AppState {
        store,
        cfg: cfg.clone(),
        http: reqwest::Client::new(),
    };
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("registry listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("registry stopped");
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
