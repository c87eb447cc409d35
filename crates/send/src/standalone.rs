//! Glue for the colocated deployment: Send hosts the WebSocket edge
//! itself and fans out straight to local holders.

use crate::pipeline::{LocalSender, OfflinePipeline, UserSink};
use async_trait::async_trait;
use common::ClientMessage;
use gateway::{ConnectionEvents, WriterHooks};
use std::sync::Arc;
use tracing::info;

/// Undeliverable frames go straight to the offline list; there is no
/// remote gateway to push back to.
pub struct StandaloneHooks {
    pipeline: Arc<OfflinePipeline>,
}

impl StandaloneHooks {
    pub fn new(pipeline: Arc<OfflinePipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl WriterHooks for StandaloneHooks {
    async fn undeliverable(&self, user_id: i64, msg: ClientMessage) {
        self.pipeline.insert_offline(user_id, &msg).await;
    }
}

/// Connect events replay the offline queue locally; there is no registry
/// to notify.
pub struct StandaloneEvents {
    pipeline: Arc<OfflinePipeline>,
    sender: Arc<LocalSender>,
}

impl StandaloneEvents {
    pub fn new(pipeline: Arc<OfflinePipeline>, sender: Arc<LocalSender>) -> Self {
        Self { pipeline, sender }
    }
}

#[async_trait]
impl ConnectionEvents for StandaloneEvents {
    async fn connected(&self, user_id: i64) {
        let pipeline = self.pipeline.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            info!("replaying offline messages for user {}", user_id);
            pipeline
                .replay_offline(user_id, sender.as_ref() as &dyn UserSink)
                .await;
        });
    }

    async fn disconnected(&self, _user_id: i64) {}
}
