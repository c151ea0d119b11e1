use service_core::error::AppError;
use thiserror::Error;

use crate::db::StoreError;
use crate::models::ScopeError;
use crate::secure::CryptoError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Record store unavailable: {0}")]
    Unavailable(anyhow::Error),

    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Whether the caller's credentials were refused.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ServiceError::Unauthorized(_) | ServiceError::TokenExpired)
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(e) => ServiceError::Unavailable(e),
            StoreError::NotFound { .. } => ServiceError::NotFound(err.to_string()),
            StoreError::Conflict { .. } => ServiceError::InvalidRequest(err.to_string()),
            StoreError::Backend(e) => ServiceError::Internal(e),
        }
    }
}

impl From<ScopeError> for ServiceError {
    fn from(err: ScopeError) -> Self {
        ServiceError::InvalidRequest(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unauthorized(e) => AppError::Unauthorized(anyhow::anyhow!(e)),
            ServiceError::TokenExpired => AppError::Unauthorized(anyhow::anyhow!("Token expired")),
            ServiceError::InvalidRequest(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            ServiceError::Unavailable(e) => AppError::ServiceUnavailable(e),
            ServiceError::Crypto(e) => AppError::InternalError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
