//! WebSocket server handler using Axum.
//!
//! Terminates client connections: authenticates the upgrade, registers a
//! holder with the connection manager, drives the gateway-initiated
//! ping/pong heartbeat, and tears the holder down when the reader stops.

use crate::connection::{ConnectionManager, FrameSink};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use common::auth::TokenVerifier;
use common::envelope::MSG_TYPE_SYSTEM;
use common::{ClientMessage, DeliveryError};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Pong must arrive within this window or the reader gives up.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping period, slightly inside the pong window.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Budget for a blocking write (greeting, ping).
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Observer of connection lifecycle; the decoupled gateway reports to the
/// registry, the standalone role replays offline messages directly.
#[async_trait]
pub trait ConnectionEvents: Send + Sync + 'static {
    async fn connected(&self, user_id: i64);
    async fn disconnected(&self, user_id: i64);
}

/// Shared application state.
pub struct WsState {
    pub manager: ConnectionManager,
    pub verifier: Arc<dyn TokenVerifier>,
    pub events: Arc<dyn ConnectionEvents>,
}

/// Create the WebSocket router.
pub fn create_ws_router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/api/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Just the upgrade route, for embedding into another service's router.
pub fn ws_only_router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/api/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<WsState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","connections":{},"outstanding":{}}}"#,
        state.manager.connection_count(),
        state.manager.outstanding()
    )
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade handler. The bearer token may arrive as a query
/// parameter or an Authorization header.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<WsState>>,
) -> impl IntoResponse {
    let token = query.token.or_else(|| {
        headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.to_string())
    });
    let user_id = token.as_deref().and_then(|t| state.verifier.verify(t));
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> std::result::Result<(), String> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| e.to_string())
    }

    async fn send_ping(&mut self) -> std::result::Result<(), String> {
        self.0
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| e.to_string())
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// Handle a WebSocket connection.
async fn handle_socket(mut socket: WebSocket, state: Arc<WsState>, user_id: Option<i64>) {
    let Some(user_id) = user_id else {
        // unauthorized upgrades receive a normal-closure frame with a
        // textual reason
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "Unauthorized".into(),
            })))
            .await;
        counter!("gateway_unauthorized_upgrades_total").increment(1);
        return;
    };

    let (ws_tx, mut ws_rx) = socket.split();
    let epoch = state.manager.register(user_id, Box::new(WsSink(ws_tx))).await;

    counter!("gateway_connections_total").increment(1);
    info!("user {} connected", user_id);

    let greeting = ClientMessage::synthetic(MSG_TYPE_SYSTEM, json!("connected"));
    if let Err(e) = state.manager.write_blocking(user_id, WRITE_WAIT, greeting).await {
        warn!("greeting for user {} failed: {}", user_id, e);
    }

    state.events.connected(user_id).await;

    // gateway-initiated heartbeat, one quick retry before giving up
    let hb_manager = state.manager.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if hb_manager.epoch_of(user_id) != Some(epoch) {
                return;
            }
            match hb_manager.ping(user_id, WRITE_WAIT).await {
                Ok(()) => continue,
                Err(DeliveryError::NoConn) => return,
                Err(e) => {
                    warn!("ping for user {} failed: {}", user_id, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if hb_manager.ping(user_id, WRITE_WAIT).await.is_err() {
                        warn!("ping retry for user {} failed, removing", user_id);
                        hb_manager.remove_if(user_id, epoch).await;
                        return;
                    }
                }
            }
        }
    });

    // reader: pongs extend the deadline; clients do not push data frames
    // on this link
    let mut deadline = Instant::now() + PONG_WAIT;
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        deadline = Instant::now() + PONG_WAIT;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite answers pings on its own
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("user {} sent close", user_id);
                        break;
                    }
                    Some(Ok(other)) => {
                        debug!("ignoring inbound frame from user {}: {:?}", user_id, other);
                    }
                    Some(Err(e)) => {
                        warn!("read error for user {}: {}", user_id, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!("read deadline exceeded for user {}", user_id);
                break;
            }
        }
    }

    heartbeat.abort();
    state.manager.remove_if(user_id, epoch).await;
    state.events.disconnected(user_id).await;

    counter!("gateway_disconnections_total").increment(1);
    info!("user {} disconnected", user_id);
}
