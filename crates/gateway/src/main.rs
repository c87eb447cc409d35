//! Gateway service entry point.
//!
//! WebSocket edge for the chat fleet: terminates client connections and
//! delivers stream-routed messages to them.

use anyhow::Result;
use async_trait::async_trait;
use common::auth::PlainIdVerifier;
use common::config::GatewayConfig;
use common::registry::RegisterGatewayRequest;
use common::ClientMessage;
use gateway::{
    create_ws_router, ConnectionEvents, ConnectionManager, LocalDispatcher, PendingCounts,
    PushbackClient, StreamPuller, WriterHooks, WsState,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use registry_client::RegistryClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{AckBatcher, Store};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Writer/teardown plumbing for the decoupled gateway: consumed frames
/// settle the pending counter, undeliverable ones go back to Send.
struct GatewayHooks {
    pending: Arc<PendingCounts>,
    pushback: Arc<PushbackClient>,
}

#[async_trait]
impl WriterHooks for GatewayHooks {
    fn message_done(&self, msg_id: i64) {
        self.pending.done(msg_id);
    }

    async fn undeliverable(&self, user_id: i64, msg: ClientMessage) {
        if let Err(e) = self.pushback.push_back(user_id, &msg).await {
            error!(
                "failed to push back message {} for user {}: {}",
                msg.id, user_id, e
            );
        }
    }
}

/// Reports client connects/disconnects to the registry, which records the
/// route and triggers the offline replay.
struct RegistryEvents {
    registry: RegistryClient,
    gateway_id: String,
}

#[async_trait]
impl ConnectionEvents for RegistryEvents {
    async fn connected(&self, user_id: i64) {
        if let Err(e) = self
            .registry
            .report_user_connect(user_id, &self.gateway_id)
            .await
        {
            warn!("failed to report connect for user {}: {}", user_id, e);
        }
    }

    async fn disconnected(&self, user_id: i64) {
        if let Err(e) = self
            .registry
            .report_user_disconnect(user_id, &self.gateway_id)
            .await
        {
            warn!("failed to report disconnect for user {}: {}", user_id, e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = GatewayConfig::from_env();
    info!("starting gateway {}", cfg.gateway_id);
    info!("  http port: {}", cfg.http_port);
    info!("  redis: {}", cfg.redis_url);
    info!("  registry: {}", cfg.registry_url);
    info!("  max connections: {}", cfg.max_connections);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], cfg.metrics_port))
        .install()
        .expect("failed to start Prometheus exporter");
    info!("metrics listening on port {}", cfg.metrics_port);

    let store = Store::connect(&cfg.redis_url)?;
    store.ping().await?;
    store.ensure_stream_group(&cfg.gateway_id).await?;
    info!("connected to store, stream group ready");

    let registry = RegistryClient::new(cfg.registry_url.clone());
    registry
        .register_gateway(&RegisterGatewayRequest {
            gateway_id: cfg.gateway_id.clone(),
            address: cfg.advertise_address.clone(),
            port: cfg.http_port,
            capacity: cfg.max_connections,
        })
        .await?;
    info!("registered with registry");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ack plumbing: pending-zero events feed the batcher, the batcher
    // XACKs the stream
    let (ack_tx, ack_rx) = AckBatcher::channel();
    let batcher = AckBatcher::new(
        store.clone(),
        cfg.gateway_id.clone(),
        ack_rx,
        cfg.ack_flush_interval,
    );
    let batcher_handle = tokio::spawn(batcher.run(shutdown_rx.clone()));

    let pending = Arc::new(PendingCounts::new(ack_tx.clone()));
    let pushback = Arc::new(PushbackClient::new(registry.clone()));

    let manager = ConnectionManager::new(
        cfg.send_channel_size,
        Duration::from_secs(10),
        Arc::new(GatewayHooks {
            pending: pending.clone(),
            pushback: pushback.clone(),
        }),
    );

    // fan-out pipeline: puller -> task channel -> workers
    let (task_tx, task_rx) = mpsc::channel(cfg.task_queue_size);
    let dispatcher = Arc::new(LocalDispatcher::new(
        manager.clone(),
        pending.clone(),
        store.clone(),
        pushback.clone(),
    ));
    let worker_handles =
        dispatcher
            .clone()
            .spawn_workers(cfg.worker_count, task_rx, shutdown_rx.clone());
    let scanner_handle = tokio::spawn(dispatcher.clone().run_wait_scanner(shutdown_rx.clone()));

    let puller = StreamPuller::new(
        store.clone(),
        cfg.gateway_id.clone(),
        manager.clone(),
        pending.clone(),
        ack_tx,
        task_tx,
        cfg.task_queue_size,
        cfg.pending_threshold,
    );
    let puller_handle = tokio::spawn(puller.run(shutdown_rx.clone()));

    // heartbeat with live load sampling
    let hb_manager = manager.clone();
    let capacity = cfg.max_connections.max(1);
    let heartbeat_handle = tokio::spawn(registry.clone().run_gateway_heartbeat(
        cfg.gateway_id.clone(),
        cfg.heartbeat_interval,
        move || {
            let connected = hb_manager.connection_count() as i64;
            (connected as f32 / capacity as f32, connected)
        },
        shutdown_rx.clone(),
    ));

    let state = Arc::new(WsState {
        manager,
        verifier: Arc::new(PlainIdVerifier),
        events: Arc::new(RegistryEvents {
            registry: registry.clone(),
            gateway_id: cfg.gateway_id.clone(),
        }),
    });
    let app = create_ws_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down background tasks...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = registry.unregister_gateway(&cfg.gateway_id).await {
        warn!("failed to unregister: {}", e);
    }
    let _ = puller_handle.await;
    let _ = scanner_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = heartbeat_handle.await;
    let _ = batcher_handle.await;

    info!("gateway stopped");
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
