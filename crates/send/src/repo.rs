//! Message acceptance: id generation plus the write-behind enqueue.
//!
//! Accepting a message means generating its id and placing the record on
//! the cache queue; the flusher moves it to MySQL later. A store failure
//! here fails the accept (the client sees a 5xx and may retry).

use crate::error::Result;
use chrono::Utc;
use common::{ChatPayload, MessageIdGenerator};
use store::{CachedMessage, Store};

pub struct MessageRepo {
    ids: MessageIdGenerator,
    store: Store,
}

impl MessageRepo {
    pub fn new(machine_id: i64, store: Store) -> Self {
        Self {
            ids: MessageIdGenerator::new(machine_id),
            store,
        }
    }

    /// Assign an id and enqueue the message for write-behind persistence.
    pub async fn insert_message(
        &self,
        room_id: i64,
        sender_id: i64,
        payload: &ChatPayload,
    ) -> Result<i64> {
        let msg_id = self.ids.next_id();
        let content = serde_json::to_value(payload).map_err(store::StoreError::from)?;
        let record = CachedMessage {
            id: msg_id,
            room_id,
            sender_id,
            msg_type: payload.tag().to_string(),
            content,
            created_at: Utc::now(),
        };
        self.store.enqueue_message(&record).await?;
        Ok(msg_id)
    }
}
