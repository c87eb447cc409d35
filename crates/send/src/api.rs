//! HTTP API of the Send service.

use crate::dispatcher::Dispatcher;
use crate::pipeline::{OfflinePipeline, UserSink};
use crate::repo::MessageRepo;
use crate::route::RouteLookup;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use common::auth::TokenVerifier;
use common::config::PushMode;
use common::envelope::MSG_TYPE_CHAT;
use common::{ChatPayload, ClientMessage, PushMessage};
use metrics::counter;
use registry_client::{RegistryClient, RegistryClientError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use store::Store;
use tracing::{error, info};

/// Shared application state.
pub struct AppState {
    pub repo: MessageRepo,
    pub store: Store,
    pub dispatcher: Dispatcher,
    pub pipeline: Arc<OfflinePipeline>,
    pub replay_sink: Arc<dyn UserSink>,
    pub registry: RegistryClient,
    pub route: Arc<dyn RouteLookup>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub push_mode: PushMode,
    /// Present only in the colocated (standalone) deployment.
    pub manager: Option<gateway::ConnectionManager>,
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat/send_message", post(send_message_handler))
        .route("/api/get_gateway_ws", get(get_gateway_ws_handler))
        .route("/internal/pushback", post(pushback_handler))
        .route("/internal/push/notify_online", post(notify_online_handler))
        .with_state(state)
}

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Deserialize)]
struct SendMessageRequest {
    room_id: i64,
    content: Value,
}

#[derive(Serialize)]
struct SendMessageResponse {
    #[serde(rename = "msgID")]
    msg_id: i64,
}

#[derive(Serialize)]
struct GatewayWsResponse {
    gateway_id: String,
    address: String,
}

#[derive(Deserialize)]
struct PushbackRequest {
    target_id: i64,
    forward_req: ClientMessage,
}

#[derive(Deserialize)]
struct NotifyRequest {
    target_id: i64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    mode: String,
    local_backlog: usize,
}

#[derive(Serialize)]
struct OkResponse {
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Bearer-token authentication; the verifier is the external auth seam.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<i64, ApiError> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| state.verifier.verify(token))
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "invalid or missing token"))
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = match state.store.ping().await {
        Ok(()) => "ok",
        Err(_) => "degraded",
    };
    let mode = match state.push_mode {
        PushMode::Standalone => "standalone",
        PushMode::Gateway => "gateway",
    };
    Json(HealthResponse {
        status: status.to_string(),
        mode: mode.to_string(),
        local_backlog: state.pipeline.local_backlog(),
    })
}

/// Accept a chat message: validate the payload, persist via write-behind,
/// resolve the room's members, and initiate the fan-out. The `msgID`
/// response means "persisted and fan-out initiated", not "delivered".
async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let sender_id = authenticate(&state, &headers)?;

    let payload = ChatPayload::from_value(&req.content)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;

    let msg_id = state
        .repo
        .insert_message(req.room_id, sender_id, &payload)
        .await
        .map_err(|e| {
            error!("failed to accept message: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to accept message")
        })?;

    let members = state.store.room_member_ids(req.room_id).await.map_err(|e| {
        error!("failed to resolve room {} members: {}", req.room_id, e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to resolve recipients")
    })?;
    let targets: Vec<i64> = members.into_iter().filter(|id| *id != sender_id).collect();

    counter!("send_messages_accepted_total").increment(1);
    info!(
        "accepted message {} for room {} ({} recipients)",
        msg_id,
        req.room_id,
        targets.len()
    );

    if !targets.is_empty() {
        let msg = PushMessage {
            id: msg_id,
            msg_type: MSG_TYPE_CHAT.to_string(),
            room_id: req.room_id,
            sender_id,
            target_ids: targets,
            payload: serde_json::to_value(&payload)
                .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
        };
        match state.push_mode {
            PushMode::Standalone => {
                let manager = state
                    .manager
                    .as_ref()
                    .expect("standalone mode has a connection manager");
                state.dispatcher.dispatch_standalone(manager, msg).await;
            }
            PushMode::Gateway => state.dispatcher.dispatch_gateway(msg).await,
        }
    }

    Ok(Json(SendMessageResponse { msg_id }))
}

/// Resolve this user's preferred gateway for the WebSocket connect.
async fn get_gateway_ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<GatewayWsResponse>, ApiError> {
    let user_id = authenticate(&state, &headers)?;
    match state.registry.available_gateway(user_id).await {
        Ok(gw) => Ok(Json(GatewayWsResponse {
            gateway_id: gw.gateway_id,
            address: format!("{}:{}", gw.address, gw.port),
        })),
        Err(RegistryClientError::Status(status)) if status.as_u16() == 503 => Err(
            error_response(StatusCode::SERVICE_UNAVAILABLE, "no available gateway"),
        ),
        Err(e) => {
            error!("gateway lookup for user {} failed: {}", user_id, e);
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "gateway lookup failed",
            ))
        }
    }
}

/// A gateway returns a message it can no longer deliver; park it on the
/// target's offline list.
async fn pushback_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PushbackRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    counter!("send_pushbacks_received_total").increment(1);
    // the gateway could not deliver, so the cached route is stale
    state.route.invalidate(req.target_id);
    state
        .pipeline
        .insert_offline(req.target_id, &req.forward_req)
        .await;
    Ok(Json(OkResponse {
        status: "ok".to_string(),
    }))
}

/// Registry tells us a user just connected; replay their offline queue
/// asynchronously and answer 202 immediately.
async fn notify_online_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NotifyRequest>,
) -> (StatusCode, Json<OkResponse>) {
    let pipeline = state.pipeline.clone();
    let sink = state.replay_sink.clone();
    let user_id = req.target_id;
    tokio::spawn(async move {
        info!("replaying offline messages for user {}", user_id);
        pipeline.replay_offline(user_id, sink.as_ref()).await;
    });
    (
        StatusCode::ACCEPTED,
        Json(OkResponse {
            status: "accepted".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_id_response_uses_wire_name() {
        let body = serde_json::to_value(SendMessageResponse { msg_id: 42 }).unwrap();
        assert_eq!(body["msgID"], 42);
    }

    #[test]
    fn pushback_request_accepts_camel_case_envelope() {
        let raw = serde_json::json!({
            "target_id": 7,
            "forward_req": {"ID": 1, "Type": "chat", "RoomID": 2, "SenderID": 3, "Payload": {}}
        });
        let req: PushbackRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.target_id, 7);
        assert_eq!(req.forward_req.id, 1);
    }
}
