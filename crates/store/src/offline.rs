//! Per-user offline and wait lists.
//!
//! The offline list holds messages for recipients believed absent; it is
//! drained on reconnect. The wait list holds messages for recipients whose
//! writer queue was full; a scanner retries them shortly after.

use crate::error::Result;
use crate::keys;
use crate::redis::Store;

const ATTEMPTS: usize = 2;

impl Store {
    pub async fn push_offline(&self, user_id: i64, raw: &str) -> Result<()> {
        self.rpush(ATTEMPTS, &keys::offline_push(user_id), raw).await
    }

    pub async fn pop_offline(&self, user_id: i64) -> Result<Option<String>> {
        self.lpop(ATTEMPTS, &keys::offline_push(user_id)).await
    }

    pub async fn offline_len(&self, user_id: i64) -> Result<i64> {
        self.llen(ATTEMPTS, &keys::offline_push(user_id)).await
    }

    pub async fn push_wait(&self, user_id: i64, raw: &str) -> Result<()> {
        self.rpush(ATTEMPTS, &keys::wait_push(user_id), raw).await
    }

    pub async fn pop_wait(&self, user_id: i64) -> Result<Option<String>> {
        self.lpop(ATTEMPTS, &keys::wait_push(user_id)).await
    }

    pub async fn wait_len(&self, user_id: i64) -> Result<i64> {
        self.llen(ATTEMPTS, &keys::wait_push(user_id)).await
    }
}
