//! HTTP API of the registry service.

use crate::error::RegistryError;
use crate::{gateways, notify, sends, users};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use common::config::RegistryConfig;
use common::registry::{
    AvailableGatewayResponse, AvailableSendResponse, BatchRoutesRequest, BatchRoutesResponse,
    GatewayHeartbeatRequest, GatewayInfo, RegisterGatewayRequest, RegisterSendRequest,
    SendHeartbeatRequest, SendInstanceInfo, UserConnectRequest, UserDisconnectRequest,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store::Store;
use tracing::error;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub cfg: RegistryConfig,
    pub http: reqwest::Client,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/registry/gateway/register", post(register_gateway_handler))
        .route("/registry/gateway/heartbeat", post(gateway_heartbeat_handler))
        .route("/registry/gateway/{id}", delete(unregister_gateway_handler))
        .route("/registry/gateway/instances", get(gateway_instances_handler))
        .route("/registry/gateway/available", get(available_gateway_handler))
        .route("/registry/send/register", post(register_send_handler))
        .route("/registry/send/heartbeat", post(send_heartbeat_handler))
        .route("/registry/send/{id}", delete(unregister_send_handler))
        .route("/registry/send/instances", get(send_instances_handler))
        .route("/registry/send/available", get(available_send_handler))
        .route("/registry/user/connect", post(user_connect_handler))
        .route("/registry/user/disconnect", post(user_disconnect_handler))
        .route("/registry/user/routes/batch", post(batch_routes_handler))
        .with_state(Arc::new(state))
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    store: String,
    gateway_count: i64,
    send_count: i64,
}

#[derive(Serialize)]
struct OkResponse {
    status: String,
}

#[derive(Serialize)]
struct GatewayInstancesResponse {
    gateways: Vec<GatewayInfo>,
    count: usize,
}

#[derive(Serialize)]
struct SendInstancesResponse {
    instances: Vec<SendInstanceInfo>,
    count: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct AvailableGatewayQuery {
    user_id: i64,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn ok() -> Json<OkResponse> {
    Json(OkResponse {
        status: "ok".to_string(),
    })
}

fn into_api_error(err: RegistryError) -> ApiError {
    let status = match &err {
        RegistryError::GatewayNotFound | RegistryError::SendInstanceNotFound => {
            StatusCode::NOT_FOUND
        }
        RegistryError::NoAvailableGateway | RegistryError::NoAvailableSend => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("registry request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

// =============================================================================
// Handlers
// =============================================================================

/// Aggregate health: store reachability plus fleet counts.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_status = match state.store.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("unreachable: {e}"),
    };
    let gateway_count = state.store.gateway_count().await.unwrap_or(0);
    let send_count = state.store.send_count().await.unwrap_or(0);
    let status = if store_status == "ok" { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        store: store_status,
        gateway_count,
        send_count,
    })
}

async fn register_gateway_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterGatewayRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    gateways::register(&state.store, &state.cfg, req)
        .await
        .map_err(into_api_error)?;
    counter!("registry_gateway_registrations_total").increment(1);
    Ok(ok())
}

async fn gateway_heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GatewayHeartbeatRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    gateways::heartbeat(&state.store, &state.cfg, req)
        .await
        .map_err(into_api_error)?;
    Ok(ok())
}

async fn unregister_gateway_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    gateways::unregister(&state.store, &id)
        .await
        .map_err(into_api_error)?;
    Ok(ok())
}

async fn gateway_instances_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GatewayInstancesResponse>, ApiError> {
    let gateways = gateways::list_live(&state.store)
        .await
        .map_err(into_api_error)?;
    let count = gateways.len();
    Ok(Json(GatewayInstancesResponse { gateways, count }))
}

/// "Where do I connect?" — pinned route first, then lowest load.
async fn available_gateway_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailableGatewayQuery>,
) -> Result<Json<AvailableGatewayResponse>, ApiError> {
    let info = gateways::select_for_user(&state.store, &state.cfg, query.user_id)
        .await
        .map_err(into_api_error)?;
    Ok(Json(AvailableGatewayResponse {
        gateway_id: info.gateway_id,
        address: info.address,
        port: info.port,
    }))
}

async fn register_send_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterSendRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    sends::register(&state.store, &state.cfg, req)
        .await
        .map_err(into_api_error)?;
    counter!("registry_send_registrations_total").increment(1);
    Ok(ok())
}

async fn send_heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendHeartbeatRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    sends::heartbeat(&state.store, &state.cfg, req)
        .await
        .map_err(into_api_error)?;
    Ok(ok())
}

async fn unregister_send_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    sends::unregister(&state.store, &id)
        .await
        .map_err(into_api_error)?;
    Ok(ok())
}

async fn send_instances_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SendInstancesResponse>, ApiError> {
    let instances = sends::list_live(&state.store)
        .await
        .map_err(into_api_error)?;
    let count = instances.len();
    Ok(Json(SendInstancesResponse { instances, count }))
}

async fn available_send_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AvailableSendResponse>, ApiError> {
    let info = sends::pick_random(&state.store)
        .await
        .map_err(into_api_error)?;
    Ok(Json(AvailableSendResponse {
        instance_id: info.instance_id,
        address: info.address,
        port: info.port,
    }))
}

/// Record the route, then asynchronously trigger the offline replay via a
/// random Send instance.
async fn user_connect_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserConnectRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    users::record_connect(&state.store, &state.cfg, req.user_id, &req.gateway_id)
        .await
        .map_err(into_api_error)?;
    counter!("registry_user_connects_total").increment(1);

    let store = state.store.clone();
    let http = state.http.clone();
    tokio::spawn(notify::notify_user_online(store, http, req.user_id));

    Ok(ok())
}

async fn user_disconnect_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserDisconnectRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    users::record_disconnect(&state.store, &state.cfg, req.user_id, &req.gateway_id)
        .await
        .map_err(into_api_error)?;
    counter!("registry_user_disconnects_total").increment(1);
    Ok(ok())
}

async fn batch_routes_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRoutesRequest>,
) -> Result<Json<BatchRoutesResponse>, ApiError> {
    let routes = users::batch_routes(&state.store, &req.user_ids)
        .await
        .map_err(into_api_error)?;
    Ok(Json(BatchRoutesResponse { routes }))
}
