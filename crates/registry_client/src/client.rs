//! Registry HTTP client plus the register/heartbeat loops the Gateway and
//! Send roles run against it.

use common::registry::{
    AvailableGatewayResponse, AvailableSendResponse, BatchRoutesRequest, BatchRoutesResponse,
    GatewayHeartbeatRequest, RegisterGatewayRequest, RegisterSendRequest, RouteInfo,
    SendHeartbeatRequest, UserConnectRequest, UserDisconnectRequest,
};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {0}")]
    Status(StatusCode),
}

pub type Result<T> = std::result::Result<T, RegistryClientError>;

/// Client for the registry's HTTP API. Cheap to clone.
#[derive(Clone)]
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        if !resp.status().is_success() {
            return Err(RegistryClientError::Status(resp.status()));
        }
        Ok(())
    }

    // ========================================================================
    // Gateway side
    // ========================================================================

    pub async fn register_gateway(&self, req: &RegisterGatewayRequest) -> Result<()> {
        self.post_json("/registry/gateway/register", req).await
    }

    pub async fn gateway_heartbeat(&self, req: &GatewayHeartbeatRequest) -> Result<()> {
        self.post_json("/registry/gateway/heartbeat", req).await
    }

    pub async fn unregister_gateway(&self, gateway_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/registry/gateway/{gateway_id}")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RegistryClientError::Status(resp.status()));
        }
        Ok(())
    }

    pub async fn report_user_connect(&self, user_id: i64, gateway_id: &str) -> Result<()> {
        self.post_json(
            "/registry/user/connect",
            &UserConnectRequest {
                user_id,
                gateway_id: gateway_id.to_string(),
            },
        )
        .await
    }

    pub async fn report_user_disconnect(&self, user_id: i64, gateway_id: &str) -> Result<()> {
        self.post_json(
            "/registry/user/disconnect",
            &UserDisconnectRequest {
                user_id,
                gateway_id: gateway_id.to_string(),
            },
        )
        .await
    }

    // ========================================================================
    // Send side
    // ========================================================================

    pub async fn register_send(&self, req: &RegisterSendRequest) -> Result<()> {
        self.post_json("/registry/send/register", req).await
    }

    pub async fn send_heartbeat(&self, req: &SendHeartbeatRequest) -> Result<()> {
        self.post_json("/registry/send/heartbeat", req).await
    }

    pub async fn unregister_send(&self, instance_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/registry/send/{instance_id}")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RegistryClientError::Status(resp.status()));
        }
        Ok(())
    }

    /// Batch user -> gateway lookup. Users with no live route are absent
    /// from the map.
    pub async fn query_user_routes(&self, user_ids: &[i64]) -> Result<HashMap<i64, RouteInfo>> {
        let resp = self
            .http
            .post(self.url("/registry/user/routes/batch"))
            .json(&BatchRoutesRequest {
                user_ids: user_ids.to_vec(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RegistryClientError::Status(resp.status()));
        }
        let body: BatchRoutesResponse = resp.json().await?;
        Ok(body.routes)
    }

    pub async fn available_gateway(&self, user_id: i64) -> Result<AvailableGatewayResponse> {
        let resp = self
            .http
            .get(self.url(&format!("/registry/gateway/available?user_id={user_id}")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RegistryClientError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }

    pub async fn available_send(&self) -> Result<AvailableSendResponse> {
        let resp = self
            .http
            .get(self.url("/registry/send/available"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RegistryClientError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }

    // ========================================================================
    // Heartbeat loops
    // ========================================================================

    /// Post gateway heartbeats every `interval` until shutdown. The
    /// closure samples the current load and connection count per tick.
    pub async fn run_gateway_heartbeat<F>(
        self,
        gateway_id: String,
        interval: Duration,
        sample: F,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: Fn() -> (f32, i64) + Send + 'static,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("gateway heartbeat loop exiting");
                    return;
                }
                _ = ticker.tick() => {
                    let (load, connected_users) = sample();
                    let req = GatewayHeartbeatRequest {
                        gateway_id: gateway_id.clone(),
                        load,
                        connected_users,
                    };
                    if let Err(e) = self.gateway_heartbeat(&req).await {
                        warn!("gateway heartbeat failed: {}", e);
                    }
                }
            }
        }
    }

    /// Post send-instance heartbeats every `interval` until shutdown.
    pub async fn run_send_heartbeat(
        self,
        instance_id: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("send heartbeat loop exiting");
                    return;
                }
                _ = ticker.tick() => {
                    let req = SendHeartbeatRequest { instance_id: instance_id.clone() };
                    if let Err(e) = self.send_heartbeat(&req).await {
                        warn!("send heartbeat failed: {}", e);
                    }
                }
            }
        }
    }
}
