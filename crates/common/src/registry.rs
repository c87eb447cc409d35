//! Registry records and the request/response shapes of the registry API.
//!
//! Shared between the registry service, its client crate, and the Send
//! side so the wire shapes live in exactly one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A gateway instance as known to the registry. TTL-bound: the record
/// expires silently when heartbeats lapse past the configured window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub gateway_id: String,
    pub address: String,
    pub port: u16,
    /// Hard cap on concurrent connections.
    pub capacity: i64,
    pub connected_users: i64,
    /// Advisory load ratio in [0, 1]; lower is preferred for new clients.
    pub load: f32,
    pub last_heartbeat: DateTime<Utc>,
}

impl GatewayInfo {
    /// `host:port` string for route records.
    pub fn address_with_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Capacity is hard; load is only advisory.
    pub fn has_capacity(&self) -> bool {
        self.connected_users < self.capacity
    }
}

/// A Send instance as known to the registry. No load field; selection
/// among instances is random.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendInstanceInfo {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub last_heartbeat: DateTime<Utc>,
}

impl SendInstanceInfo {
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// Connection status carried in a user route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    Connected,
    Disconnected,
}

/// user -> gateway mapping. Preserved (with the same TTL) on disconnect
/// so a quick reconnect lands on the same gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRoute {
    pub user_id: i64,
    pub gateway_id: String,
    pub address: String,
    pub connected_at: DateTime<Utc>,
    pub status: RouteStatus,
}

/// The slice of a route the dispatcher needs for batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub gateway_id: String,
    pub address: String,
}

// ============================================================================
// Registry HTTP shapes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterGatewayRequest {
    pub gateway_id: String,
    pub address: String,
    pub port: u16,
    pub capacity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayHeartbeatRequest {
    pub gateway_id: String,
    pub load: f32,
    pub connected_users: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSendRequest {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendHeartbeatRequest {
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConnectRequest {
    pub user_id: i64,
    pub gateway_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDisconnectRequest {
    pub user_id: i64,
    pub gateway_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRoutesRequest {
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRoutesResponse {
    /// Only users with a live route appear; absence means offline.
    pub routes: HashMap<i64, RouteInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableGatewayResponse {
    pub gateway_id: String,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSendResponse {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_status_serializes_lowercase() {
        let route = UserRoute {
            user_id: 1,
            gateway_id: "gw-1".into(),
            address: "10.0.0.1:8080".into(),
            connected_at: Utc::now(),
            status: RouteStatus::Disconnected,
        };
        let value = serde_json::to_value(&route).unwrap();
        assert_eq!(value["status"], "disconnected");
    }

    #[test]
    fn capacity_is_hard_and_load_advisory() {
        let mut info = GatewayInfo {
            gateway_id: "gw-1".into(),
            address: "10.0.0.1".into(),
            port: 8080,
            capacity: 2,
            connected_users: 1,
            load: 1.1,
            last_heartbeat: Utc::now(),
        };
        assert!(info.has_capacity());
        info.connected_users = 2;
        assert!(!info.has_capacity());
    }
}
