//! Flusher error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlusherError {
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, FlusherError>;
