//! Send service entry point.
//!
//! Accepts chat submissions, persists them via write-behind, and fans
//! them out to the gateway fleet (or to local holders in standalone
//! mode).

use anyhow::Result;
use common::auth::PlainIdVerifier;
use common::config::{PushMode, SendConfig};
use common::registry::RegisterSendRequest;
use metrics_exporter_prometheus::PrometheusBuilder;
use registry_client::RegistryClient;
use send::dispatcher::{run_ack_router, DispatchCore, Dispatcher, GatewaySink, StreamSink};
use send::pipeline::{GatewayRoutedSender, LocalSender, OfflinePipeline, UserSink};
use send::route::{RouteLookup, RouteService};
use send::standalone::{StandaloneEvents, StandaloneHooks};
use send::{AppState, MessageRepo, PendingTracker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = SendConfig::from_env();
    info!("starting send instance {}", cfg.instance_id);
    info!("  http port: {}", cfg.http_port);
    info!("  redis: {}", cfg.redis_url);
    info!("  registry: {}", cfg.registry_url);
    info!("  push mode: {:?}", cfg.push_mode);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], cfg.metrics_port))
        .install()
        .expect("failed to start Prometheus exporter");
    info!("metrics listening on port {}", cfg.metrics_port);

    let store = Store::connect(&cfg.redis_url)?;
    store.ping().await?;
    info!("connected to store");

    let registry = RegistryClient::new(cfg.registry_url.clone());
    registry
        .register_send(&RegisterSendRequest {
            instance_id: cfg.instance_id.clone(),
            address: cfg.advertise_address.clone(),
            port: cfg.http_port,
        })
        .await?;
    info!("registered with registry");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pipeline = Arc::new(OfflinePipeline::new(store.clone()));
    let route = Arc::new(RouteService::new(registry.clone(), cfg.route_cache_ttl));
    let route_dyn: Arc<dyn RouteLookup> = route.clone();
    let sink: Arc<dyn GatewaySink> = Arc::new(StreamSink::new(store.clone()));

    let (zero_tx, zero_rx) = mpsc::unbounded_channel();
    let pending = Arc::new(PendingTracker::new(zero_tx));
    let core = Arc::new(DispatchCore::new(
        route_dyn,
        sink.clone(),
        pipeline.clone(),
        pending,
    ));
    let (dispatcher, worker_handles) = Dispatcher::start(
        core.clone(),
        cfg.worker_count,
        cfg.queue_size,
        shutdown_rx.clone(),
    );

    let verifier = Arc::new(PlainIdVerifier);

    // per-mode delivery plumbing for acks and offline replay
    let (manager, replay_sink, ws_router, scanner_handle) = match cfg.push_mode {
        PushMode::Gateway => {
            let sink: Arc<dyn UserSink> =
                Arc::new(GatewayRoutedSender::new(route.clone(), sink.clone()));
            (None, sink, None, None)
        }
        PushMode::Standalone => {
            let manager = gateway::ConnectionManager::new(
                cfg.send_channel_size,
                Duration::from_secs(10),
                Arc::new(StandaloneHooks::new(pipeline.clone())),
            );
            let local_sender = Arc::new(LocalSender::new(manager.clone()));
            let ws_state = Arc::new(gateway::WsState {
                manager: manager.clone(),
                verifier: verifier.clone(),
                events: Arc::new(StandaloneEvents::new(
                    pipeline.clone(),
                    local_sender.clone(),
                )),
            });
            let scanner = tokio::spawn(
                pipeline
                    .clone()
                    .run_wait_scanner(manager.clone(), shutdown_rx.clone()),
            );
            (
                Some(manager),
                local_sender as Arc<dyn UserSink>,
                Some(gateway::ws_only_router(ws_state)),
                Some(scanner),
            )
        }
    };

    let ack_handle = tokio::spawn(run_ack_router(
        core,
        zero_rx,
        replay_sink.clone(),
        shutdown_rx.clone(),
    ));
    let recovery_handle = tokio::spawn(pipeline.clone().run_recovery_sweep(shutdown_rx.clone()));
    let heartbeat_handle = tokio::spawn(registry.clone().run_send_heartbeat(
        cfg.instance_id.clone(),
        cfg.heartbeat_interval,
        shutdown_rx.clone(),
    ));

    let state = Arc::new(AppState {
        repo: MessageRepo::new(cfg.machine_id, store.clone()),
        store,
        dispatcher,
        pipeline,
        replay_sink,
        registry: registry.clone(),
        route: route.clone(),
        verifier,
        push_mode: cfg.push_mode,
        manager,
    });
    let mut app = send::create_router(state);
    if let Some(ws_router) = ws_router {
        app = app.merge(ws_router);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("send listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down background tasks...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = registry.unregister_send(&cfg.instance_id).await {
        warn!("failed to unregister: {}", e);
    }
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = ack_handle.await;
    let _ = recovery_handle.await;
    let _ = heartbeat_handle.await;
    if let Some(handle) = scanner_handle {
        let _ = handle.await;
    }

    info!("send stopped");
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
