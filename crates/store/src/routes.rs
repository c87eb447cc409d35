//! User routes and registry instance records.

use crate::error::Result;
use crate::keys;
use crate::redis::Store;
use common::registry::{GatewayInfo, RouteInfo, SendInstanceInfo, UserRoute};
use std::collections::HashMap;
use std::time::Duration;

const ATTEMPTS: usize = 2;

impl Store {
    // ========================================================================
    // User routes
    // ========================================================================

    pub async fn put_user_route(&self, route: &UserRoute, ttl: Duration) -> Result<()> {
        self.set_json_ex(ATTEMPTS, &keys::route_user(route.user_id), route, ttl)
            .await
    }

    pub async fn get_user_route(&self, user_id: i64) -> Result<Option<UserRoute>> {
        self.get_json(ATTEMPTS, &keys::route_user(user_id)).await
    }

    pub async fn delete_user_route(&self, user_id: i64) -> Result<()> {
        self.del(ATTEMPTS, &keys::route_user(user_id)).await
    }

    /// One MGET for the whole batch. Users with no live route (or an
    /// unparseable record) are absent from the result.
    pub async fn batch_user_routes(&self, user_ids: &[i64]) -> Result<HashMap<i64, RouteInfo>> {
        let route_keys: Vec<String> = user_ids.iter().map(|id| keys::route_user(*id)).collect();
        let values = self.mget(ATTEMPTS, &route_keys).await?;

        let mut routes = HashMap::new();
        for (idx, value) in values.into_iter().enumerate() {
            let Some(raw) = value else { continue };
            match serde_json::from_str::<UserRoute>(&raw) {
                Ok(route) => {
                    routes.insert(
                        user_ids[idx],
                        RouteInfo {
                            gateway_id: route.gateway_id,
                            address: route.address,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!("malformed route for user {}: {}", user_ids[idx], e);
                }
            }
        }
        Ok(routes)
    }

    // ========================================================================
    // Gateway records
    // ========================================================================

    pub async fn put_gateway_info(&self, info: &GatewayInfo, ttl: Duration) -> Result<()> {
        self.set_json_ex(ATTEMPTS, &keys::registry_gateway(&info.gateway_id), info, ttl)
            .await?;
        self.zadd(
            ATTEMPTS,
            keys::GATEWAY_RANKING,
            &info.gateway_id,
            (info.load * 1000.0) as f64,
        )
        .await?;
        self.sadd(ATTEMPTS, keys::GATEWAY_INSTANCES, &info.gateway_id)
            .await
    }

    pub async fn get_gateway_info(&self, gateway_id: &str) -> Result<Option<GatewayInfo>> {
        self.get_json(ATTEMPTS, &keys::registry_gateway(gateway_id))
            .await
    }

    pub async fn gateway_alive(&self, gateway_id: &str) -> Result<bool> {
        self.exists(ATTEMPTS, &keys::registry_gateway(gateway_id))
            .await
    }

    pub async fn remove_gateway(&self, gateway_id: &str) -> Result<()> {
        self.del(ATTEMPTS, &keys::registry_gateway(gateway_id)).await?;
        self.zrem(ATTEMPTS, keys::GATEWAY_RANKING, gateway_id).await?;
        self.srem(ATTEMPTS, keys::GATEWAY_INSTANCES, gateway_id).await
    }

    /// Gateway ids ordered by ranking score (lowest load first).
    pub async fn ranked_gateway_ids(&self, start: isize, stop: isize) -> Result<Vec<String>> {
        self.zrange(ATTEMPTS, keys::GATEWAY_RANKING, start, stop).await
    }

    pub async fn gateway_instance_ids(&self) -> Result<Vec<String>> {
        self.smembers(ATTEMPTS, keys::GATEWAY_INSTANCES).await
    }

    pub async fn gateway_count(&self) -> Result<i64> {
        self.scard(ATTEMPTS, keys::GATEWAY_INSTANCES).await
    }

    // ========================================================================
    // Send instance records
    // ========================================================================

    pub async fn put_send_info(&self, info: &SendInstanceInfo, ttl: Duration) -> Result<()> {
        self.set_json_ex(ATTEMPTS, &keys::registry_send(&info.instance_id), info, ttl)
            .await?;
        self.sadd(ATTEMPTS, keys::SEND_INSTANCES, &info.instance_id)
            .await
    }

    pub async fn get_send_info(&self, instance_id: &str) -> Result<Option<SendInstanceInfo>> {
        self.get_json(ATTEMPTS, &keys::registry_send(instance_id))
            .await
    }

    pub async fn remove_send(&self, instance_id: &str) -> Result<()> {
        self.del(ATTEMPTS, &keys::registry_send(instance_id)).await?;
        self.srem(ATTEMPTS, keys::SEND_INSTANCES, instance_id).await
    }

    pub async fn send_instance_ids(&self) -> Result<Vec<String>> {
        self.smembers(ATTEMPTS, keys::SEND_INSTANCES).await
    }

    pub async fn send_count(&self) -> Result<i64> {
        self.scard(ATTEMPTS, keys::SEND_INSTANCES).await
    }
}
