//! Registry service: fleet liveness and user-route discovery over the
//! shared store.

pub mod api;
pub mod error;
pub mod gateways;
pub mod notify;
pub mod sends;
pub mod users;

pub use api::{create_router, AppState};
pub use error::{RegistryError, Result};
