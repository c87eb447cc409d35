//! Shared-store access layer: retry-wrapped Redis commands plus the typed
//! operations the delivery pipeline is built on (routes, registry records,
//! offline/wait lists, per-gateway streams, group cache, write-behind
//! queues).

pub mod error;
pub mod groups;
pub mod keys;
pub mod messages;
pub mod offline;
pub mod redis;
pub mod routes;
pub mod stream;

pub use error::{Result, StoreError};
pub use messages::CachedMessage;
pub use redis::Store;
pub use stream::{AckBatcher, PulledEntry};
