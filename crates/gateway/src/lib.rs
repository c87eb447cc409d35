//! Gateway service library.
//!
//! This service:
//! - Accepts WebSocket connections from chat clients
//! - Owns one serialized writer per online user
//! - Pulls routed `PushMessage` batches from its per-gateway stream
//! - Fans each message out to local holders, diverting failures to the
//!   offline/wait pipelines
//!
//! ```text
//! stream:<gateway_id>
//!         ↓
//! StreamPuller (consumer group, back-pressure gated)
//!         ↓
//! LocalDispatcher → ConnectionManager (DashMap of holders)
//!         ↓
//! WebSocket clients
//! ```
//!
//! The Send role reuses [`ConnectionManager`] and the WebSocket server
//! for its colocated (standalone) deployment mode.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod puller;
pub mod pushback;
pub mod ws_server;

pub use connection::{ConnectionManager, FrameSink, NoopHooks, WriterHooks};
pub use dispatch::LocalDispatcher;
pub use error::{GatewayError, Result};
pub use pending::PendingCounts;
pub use puller::StreamPuller;
pub use pushback::PushbackClient;
pub use ws_server::{create_ws_router, ws_only_router, ConnectionEvents, WsState};
