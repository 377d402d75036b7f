//! Error taxonomy shared by every handler.

use thiserror::Error;

use crate::protocol::{Response, StatusCode};
use crate::repository::RepoError;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Every failure a handler can answer with. None of these close the connection.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ServiceError::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ServiceError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::Conflict(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::ValidationError,
            ServiceError::Unauthorized(_) => StatusCode::Unauthorized,
            ServiceError::Forbidden(_) => StatusCode::Forbidden,
            ServiceError::NotFound(_) => StatusCode::NotFound,
            ServiceError::Conflict(_) => StatusCode::Conflict,
            ServiceError::Repository(RepoError::Duplicate(_)) => StatusCode::Conflict,
            ServiceError::Repository(RepoError::Missing(_)) => StatusCode::NotFound,
            ServiceError::Repository(RepoError::Backend(_))
            | ServiceError::Storage(_)
            | ServiceError::Internal(_) => StatusCode::ServerError,
        }
    }

    /// Convert to a wire response. Server-side details are logged, never sent.
    pub fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match self {
            ServiceError::Validation(msg)
            | ServiceError::Unauthorized(msg)
            | ServiceError::Forbidden(msg)
            | ServiceError::NotFound(msg)
            | ServiceError::Conflict(msg) => msg,
            ServiceError::Repository(RepoError::Duplicate(what)) => format!("{} already exists", what),
            ServiceError::Repository(RepoError::Missing(what)) => format!("{} not found", what),
            ServiceError::Repository(e) => {
                tracing::error!("Repository error: {}", e);
                "Database error".to_string()
            }
            ServiceError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                "Storage error".to_string()
            }
            ServiceError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
        };
        Response::error(status, message)
    }
}

/// A well-formed frame with a bad `data` map is the caller's fault.
impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Validation(format!("Invalid request data: {}", e))
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Internal(format!("background task failed: {}", e))
    }
}
