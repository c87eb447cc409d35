//! Send instance membership. Selection among instances is random.

use crate::error::{RegistryError, Result};
use chrono::Utc;
use common::config::RegistryConfig;
use common::registry::{RegisterSendRequest, SendHeartbeatRequest, SendInstanceInfo};
use rand::seq::SliceRandom;
use store::Store;
use tracing::{debug, info, warn};

pub async fn register(store: &Store, cfg: &RegistryConfig, req: RegisterSendRequest) -> Result<()> {
    let info = SendInstanceInfo {
        instance_id: req.instance_id.clone(),
        address: req.address,
        port: req.port,
        last_heartbeat: Utc::now(),
    };
    store.put_send_info(&info, cfg.send_heartbeat_window).await?;
    info!(
        "send instance {} registered at {}:{}",
        info.instance_id, info.address, info.port
    );
    Ok(())
}

pub async fn heartbeat(store: &Store, cfg: &RegistryConfig, req: SendHeartbeatRequest) -> Result<()> {
    let mut info = store
        .get_send_info(&req.instance_id)
        .await?
        .ok_or(RegistryError::SendInstanceNotFound)?;
    info.last_heartbeat = Utc::now();
    store.put_send_info(&info, cfg.send_heartbeat_window).await?;
    debug!("send instance {} heartbeat", req.instance_id);
    Ok(())
}

pub async fn unregister(store: &Store, instance_id: &str) -> Result<()> {
    store.remove_send(instance_id).await?;
    info!("send instance {} unregistered", instance_id);
    Ok(())
}

pub async fn list_live(store: &Store) -> Result<Vec<SendInstanceInfo>> {
    let ids = store.send_instance_ids().await?;
    let mut instances = Vec::with_capacity(ids.len());
    for id in ids {
        match store.get_send_info(&id).await {
            Ok(Some(info)) => instances.push(info),
            Ok(None) => {
                warn!("dropping expired send instance {} from set", id);
                let _ = store.remove_send(&id).await;
            }
            Err(e) => warn!("skipping send instance {}: {}", id, e),
        }
    }
    Ok(instances)
}

/// One random live instance.
pub async fn pick_random(store: &Store) -> Result<SendInstanceInfo> {
    let instances = list_live(store).await?;
    instances
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or(RegistryError::NoAvailableSend)
}
