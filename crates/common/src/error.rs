//! Delivery-pipeline error kinds.
//!
//! The dispatcher's branching on these is load-bearing: `NoConn` diverts
//! to the offline list, `EnqueueTimeout` to the wait list, and store
//! failures to the in-process fallback buffers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Recipient has no connection on the resolved gateway.
    #[error("no connection for user")]
    NoConn,

    /// Writer queue full within the deadline, or a blocking write did not
    /// report completion in time.
    #[error("enqueue timeout")]
    EnqueueTimeout,

    /// Socket write failed; the holder is torn down.
    #[error("socket write failed: {0}")]
    Write(String),

    /// Shared store unreachable; callers fall back to local buffers.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// No live route for the user; treated as offline.
    #[error("no live route for user")]
    RouteMiss,

    /// Every gateway saturated or missing.
    #[error("no available gateway")]
    NoAvailableGateway,

    /// Payload failed framing validation; the message is not accepted.
    #[error("invalid message content: {0}")]
    InvalidContent(String),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
