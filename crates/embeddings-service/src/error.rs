//! Service error type and its HTTP status mapping.

use axum::http::StatusCode;
use thiserror::Error;

use embeddings_models::EmbeddingError;
use embeddings_storage::StorageError;

/// Errors surfaced by API operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Malformed request payload
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl ServiceError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) | ServiceError::Storage(StorageError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Embedding(e) => match e {
                EmbeddingError::UnknownModel(_) => StatusCode::NOT_FOUND,
                EmbeddingError::NoInput
                | EmbeddingError::InvalidInput(_)
                | EmbeddingError::Decode(_)
                | EmbeddingError::DimensionMismatch { .. }
                | EmbeddingError::UnsupportedModality { .. } => StatusCode::BAD_REQUEST,
                EmbeddingError::Fetch { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}
