//! Embedding error types.

use thiserror::Error;

use embeddings_types::ModelType;

/// Errors that can occur during model management and embedding.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Identifier absent from the model catalog
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Every loading strategy for the model failed
    #[error("Failed to load model {model}: {reason}")]
    Load { model: String, reason: String },

    /// A required output field was absent from a joint model forward pass
    #[error("Model {model} produced no {field} output")]
    MissingOutput { model: String, field: &'static str },

    /// Query embedding requested without any contribution
    #[error("No inputs provided for building query embedding")]
    NoInput,

    /// Remote image could not be fetched
    #[error("Failed to fetch image {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Inline image payload could not be decoded
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// The model's computation path cannot handle this content
    #[error("Model {model} does not support {modality} content")]
    UnsupportedModality { model: String, modality: ModelType },

    /// Candle model error
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Download error
    #[error("Failed to download model: {0}")]
    Download(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// State mirror write failed
    #[error("State mirror error: {0}")]
    Mirror(String),

    /// Blocking compute task failed to complete
    #[error("Compute task failed: {0}")]
    Task(String),
}

impl EmbeddingError {
    /// Wrap any displayable failure as a load error for `model`.
    pub fn load(model: &str, reason: impl std::fmt::Display) -> Self {
        EmbeddingError::Load {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }
}
