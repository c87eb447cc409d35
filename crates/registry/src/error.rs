//! Registry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("gateway not found")]
    GatewayNotFound,

    #[error("send instance not found")]
    SendInstanceNotFound,

    #[error("no available gateway")]
    NoAvailableGateway,

    #[error("no available send instance")]
    NoAvailableSend,
}

pub type Result<T> = std::result::Result<T, RegistryError>;
