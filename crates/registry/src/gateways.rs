//! Gateway fleet membership and load-ranked selection.

use crate::error::{RegistryError, Result};
use chrono::Utc;
use common::config::RegistryConfig;
use common::registry::{GatewayHeartbeatRequest, GatewayInfo, RegisterGatewayRequest};
use store::Store;
use tracing::{debug, info, warn};

/// Page size when walking the ranked set past saturated gateways.
const RANKING_PAGE: isize = 6;

pub async fn register(store: &Store, cfg: &RegistryConfig, req: RegisterGatewayRequest) -> Result<()> {
    let info = GatewayInfo {
        gateway_id: req.gateway_id.clone(),
        address: req.address,
        port: req.port,
        capacity: req.capacity,
        connected_users: 0,
        load: 0.0,
        last_heartbeat: Utc::now(),
    };
    store
        .put_gateway_info(&info, cfg.gateway_heartbeat_window)
        .await?;
    info!(
        "gateway {} registered at {}:{} (capacity {})",
        info.gateway_id, info.address, info.port, info.capacity
    );
    Ok(())
}

/// Revive the record's TTL and refresh its load and connection count. The
/// ranking score is `load * 1000`.
pub async fn heartbeat(
    store: &Store,
    cfg: &RegistryConfig,
    req: GatewayHeartbeatRequest,
) -> Result<()> {
    let mut info = store
        .get_gateway_info(&req.gateway_id)
        .await?
        .ok_or(RegistryError::GatewayNotFound)?;

    info.load = req.load;
    info.connected_users = req.connected_users;
    info.last_heartbeat = Utc::now();

    store
        .put_gateway_info(&info, cfg.gateway_heartbeat_window)
        .await?;
    debug!(
        "gateway {} heartbeat (load {:.3}, connected {})",
        req.gateway_id, req.load, req.connected_users
    );
    Ok(())
}

pub async fn unregister(store: &Store, gateway_id: &str) -> Result<()> {
    store.remove_gateway(gateway_id).await?;
    info!("gateway {} unregistered", gateway_id);
    Ok(())
}

/// All gateways with a live record. Ids whose record has expired are
/// removed from the instance set as they are encountered.
pub async fn list_live(store: &Store) -> Result<Vec<GatewayInfo>> {
    let ids = store.gateway_instance_ids().await?;
    let mut gateways = Vec::with_capacity(ids.len());
    for id in ids {
        match store.get_gateway_info(&id).await {
            Ok(Some(info)) => gateways.push(info),
            Ok(None) => {
                warn!("dropping expired gateway {} from instance set", id);
                let _ = store.remove_gateway(&id).await;
            }
            Err(e) => warn!("skipping gateway {}: {}", id, e),
        }
    }
    Ok(gateways)
}

/// Pick a gateway for a connecting user: a still-live pinned route wins,
/// otherwise the lowest-ranked gateway with spare capacity.
pub async fn select_for_user(
    store: &Store,
    _cfg: &RegistryConfig,
    user_id: i64,
) -> Result<GatewayInfo> {
    if let Some(route) = store.get_user_route(user_id).await.ok().flatten() {
        if store.gateway_alive(&route.gateway_id).await.unwrap_or(false) {
            if let Some(info) = store.get_gateway_info(&route.gateway_id).await? {
                debug!(
                    "user {} pinned to previous gateway {}",
                    user_id, info.gateway_id
                );
                return Ok(info);
            }
        }
        debug!(
            "previous gateway {} for user {} is gone, selecting fresh",
            route.gateway_id, user_id
        );
    }

    let mut start: isize = 0;
    loop {
        let ids = store
            .ranked_gateway_ids(start, start + RANKING_PAGE - 1)
            .await?;
        if ids.is_empty() {
            return Err(RegistryError::NoAvailableGateway);
        }
        let mut candidates = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(info) = store.get_gateway_info(id).await? {
                candidates.push(info);
            }
        }
        if let Some(info) = first_with_capacity(&candidates) {
            return Ok(info.clone());
        }
        start += RANKING_PAGE;
    }
}

/// First candidate (in ranking order) whose hard capacity is not
/// exhausted. Load is advisory only, so a gateway reporting load >= 1.0
/// remains eligible while it has headroom.
fn first_with_capacity(candidates: &[GatewayInfo]) -> Option<&GatewayInfo> {
    candidates.iter().find(|info| info.has_capacity())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gw(id: &str, load: f32, connected: i64, capacity: i64) -> GatewayInfo {
        GatewayInfo {
            gateway_id: id.to_string(),
            address: "10.0.0.1".into(),
            port: 8082,
            capacity,
            connected_users: connected,
            load,
            last_heartbeat: Utc::now(),
        }
    }

    #[test]
    fn lowest_ranked_gateway_wins() {
        // ranking order as the zset would return it: by load ascending
        let ranked = vec![
            gw("gw-a", 0.2, 10, 100),
            gw("gw-b", 0.5, 10, 100),
            gw("gw-c", 0.9, 10, 100),
            gw("gw-d", 1.1, 10, 100),
        ];
        assert_eq!(first_with_capacity(&ranked).unwrap().gateway_id, "gw-a");
    }

    #[test]
    fn saturated_gateway_is_skipped() {
        let ranked = vec![gw("gw-a", 0.2, 100, 100), gw("gw-b", 0.5, 10, 100)];
        assert_eq!(first_with_capacity(&ranked).unwrap().gateway_id, "gw-b");
    }

    #[test]
    fn overloaded_but_not_full_is_still_eligible() {
        let ranked = vec![gw("gw-a", 1.1, 50, 100)];
        assert_eq!(first_with_capacity(&ranked).unwrap().gateway_id, "gw-a");
    }

    #[test]
    fn exactly_at_capacity_is_rejected() {
        let ranked = vec![gw("gw-a", 0.1, 100, 100)];
        assert!(first_with_capacity(&ranked).is_none());
    }
}
