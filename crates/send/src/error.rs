//! Send service error types.

use common::envelope::PayloadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] registry_client::RegistryClientError),

    #[error("invalid content: {0}")]
    InvalidContent(#[from] PayloadError),

    #[error("delivery error: {0}")]
    Delivery(#[from] common::DeliveryError),
}

pub type Result<T> = std::result::Result<T, SendError>;
