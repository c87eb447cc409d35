//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Shared store error.
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    /// Registry client error.
    #[error("registry error: {0}")]
    Registry(#[from] registry_client::RegistryClientError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Pushback endpoint rejected the request.
    #[error("pushback returned {0}")]
    PushbackStatus(reqwest::StatusCode),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
