//! Pushback client: returns messages this gateway can no longer deliver
//! to a Send instance, which parks them in the target's offline list.

use crate::error::{GatewayError, Result};
use common::ClientMessage;
use registry_client::RegistryClient;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// How long a resolved Send instance address is reused.
const RESOLVE_TTL: Duration = Duration::from_secs(30);

pub struct PushbackClient {
    http: reqwest::Client,
    registry: RegistryClient,
    cached: Mutex<Option<(String, Instant)>>,
}

impl PushbackClient {
    pub fn new(registry: RegistryClient) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");
        Self {
            http,
            registry,
            cached: Mutex::new(None),
        }
    }

    /// POST one unroutable message back to a Send instance.
    pub async fn push_back(&self, target_id: i64, msg: &ClientMessage) -> Result<()> {
        let base = self.resolve().await?;
        let url = format!("{base}/internal/pushback");
        let body = json!({ "target_id": target_id, "forward_req": msg });
        let resp = match self.http.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.invalidate().await;
                return Err(GatewayError::Http(e));
            }
        };
        if !resp.status().is_success() {
            self.invalidate().await;
            return Err(GatewayError::PushbackStatus(resp.status()));
        }
        debug!("pushed back message {} for user {}", msg.id, target_id);
        metrics::counter!("gateway_pushbacks_total").increment(1);
        Ok(())
    }

    async fn resolve(&self) -> Result<String> {
        {
            let cached = self.cached.lock().await;
            if let Some((url, resolved_at)) = cached.as_ref() {
                if resolved_at.elapsed() < RESOLVE_TTL {
                    return Ok(url.clone());
                }
            }
        }
        let instance = self.registry.available_send().await?;
        let url = format!("http://{}:{}", instance.address, instance.port);
        *self.cached.lock().await = Some((url.clone(), Instant::now()));
        Ok(url)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
