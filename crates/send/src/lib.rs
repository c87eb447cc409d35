//! Send service library: chat submission, recipient resolution, batching
//! fan-out with per-message completion tracking, route caching, and the
//! offline/wait pipelines.

pub mod api;
pub mod dispatcher;
pub mod error;
pub mod pending;
pub mod pipeline;
pub mod repo;
pub mod route;
pub mod standalone;

pub use api::{create_router, AppState};
pub use dispatcher::{DispatchCore, Dispatcher, GatewaySink, StreamSink};
pub use error::{Result, SendError};
pub use pending::PendingTracker;
pub use pipeline::{GatewayRoutedSender, LocalSender, OfflinePipeline, UserSink};
pub use repo::MessageRepo;
pub use route::{RouteCache, RouteLookup, RouteService};
