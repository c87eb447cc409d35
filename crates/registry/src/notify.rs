//! Online notification: when a user connects, tell one Send instance so
//! it can replay that user's offline queue.

use crate::sends;
use serde_json::json;
use std::time::Duration;
use store::Store;
use tracing::{info, warn};

const NOTIFY_ATTEMPTS: usize = 2;
const NOTIFY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Fire-and-forget: pick a random live Send instance and POST the
/// user-online notification, retrying once.
pub async fn notify_user_online(store: Store, http: reqwest::Client, user_id: i64) {
    let instance = match sends::pick_random(&store).await {
        Ok(instance) => instance,
        Err(e) => {
            warn!(
                "no send instance available to notify for user {}: {}",
                user_id, e
            );
            return;
        }
    };

    let url = format!("{}/internal/push/notify_online", instance.http_url());
    let body = json!({ "target_id": user_id });

    for attempt in 0..NOTIFY_ATTEMPTS {
        match http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!("notified {} that user {} is online", url, user_id);
                return;
            }
            Ok(resp) => {
                warn!(
                    "online notify to {} returned {} (attempt {})",
                    url,
                    resp.status(),
                    attempt
                );
            }
            Err(e) => {
                warn!("online notify to {} failed (attempt {}): {}", url, attempt, e);
            }
        }
        tokio::time::sleep(NOTIFY_RETRY_DELAY).await;
    }
}
