//! One-way sync of model state into a persistent store.

use async_trait::async_trait;

use embeddings_types::ModelType;

use crate::error::EmbeddingError;

/// Receives model load state changes.
///
/// Implementations upsert the named record with the given `loaded` flag and
/// then activate it if no model of the same type is active yet. The manager
/// logs and swallows every error.
#[async_trait]
pub trait StateMirror: Send + Sync {
    async fn record_model_state(
        &self,
        name: &str,
        model_type: ModelType,
        loaded: bool,
    ) -> Result<(), EmbeddingError>;
}

/// Mirror that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMirror;

#[async_trait]
impl StateMirror for NoopMirror {
    async fn record_model_state(
        &self,
        _name: &str,
        _model_type: ModelType,
        _loaded: bool,
    ) -> Result<(), EmbeddingError> {
        Ok(())
    }
}
