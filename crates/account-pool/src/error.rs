//! Error types for pool operations

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no healthy account available")]
    PoolExhausted,

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("account store error: {0}")]
    Store(#[from] account_store::Error),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
