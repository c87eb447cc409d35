//! User route recording and lookup.

use crate::error::{RegistryError, Result};
use chrono::Utc;
use common::config::RegistryConfig;
use common::registry::{RouteInfo, RouteStatus, UserRoute};
use std::collections::HashMap;
use store::Store;
use tracing::{info, warn};

pub async fn record_connect(
    store: &Store,
    cfg: &RegistryConfig,
    user_id: i64,
    gateway_id: &str,
) -> Result<()> {
    let gw = store
        .get_gateway_info(gateway_id)
        .await?
        .ok_or(RegistryError::GatewayNotFound)?;

    let route = UserRoute {
        user_id,
        gateway_id: gateway_id.to_string(),
        address: gw.address_with_port(),
        connected_at: Utc::now(),
        status: RouteStatus::Connected,
    };
    store.put_user_route(&route, cfg.user_route_ttl).await?;
    info!("user {} routed to gateway {}", user_id, gateway_id);
    Ok(())
}

/// Keep the route but flip its status, retaining the TTL so a quick
/// reconnect lands on the same gateway.
pub async fn record_disconnect(
    store: &Store,
    cfg: &RegistryConfig,
    user_id: i64,
    gateway_id: &str,
) -> Result<()> {
    let Some(mut route) = store.get_user_route(user_id).await? else {
        // already expired; nothing to update
        return Ok(());
    };
    if route.gateway_id != gateway_id {
        warn!(
            "disconnect for user {} names gateway {} but route points at {}",
            user_id, gateway_id, route.gateway_id
        );
        return Ok(());
    }
    route.status = RouteStatus::Disconnected;
    store.put_user_route(&route, cfg.user_route_ttl).await?;
    info!("user {} marked disconnected (route retained)", user_id);
    Ok(())
}

pub async fn batch_routes(store: &Store, user_ids: &[i64]) -> Result<HashMap<i64, RouteInfo>> {
    Ok(store.batch_user_routes(user_ids).await?)
}
