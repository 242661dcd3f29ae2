//! Model load state mirrored into the document store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use embeddings_models::{EmbeddingError, StateMirror};
use embeddings_storage::Storage;
use embeddings_types::ModelType;

/// `StateMirror` backed by the `system_models` collection.
///
/// Every write upserts the record and then activates it when no model of
/// the same type is active.
pub struct StorageMirror {
    storage: Arc<Storage>,
}

impl StorageMirror {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl StateMirror for StorageMirror {
    async fn record_model_state(
        &self,
        name: &str,
        model_type: ModelType,
        loaded: bool,
    ) -> Result<(), EmbeddingError> {
        let mirror_err = |e: embeddings_storage::StorageError| EmbeddingError::Mirror(e.to_string());
        let record = self
            .storage
            .record_model_state(name, model_type, loaded)
            .map_err(mirror_err)?;
        let record = self
            .storage
            .ensure_active_if_none(&record)
            .map_err(mirror_err)?;
        debug!(model = %name, loaded, active = record.active, "Mirrored model state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mirror_upserts_and_activates_first() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        let mirror = StorageMirror::new(storage.clone());

        mirror.record_model_state("a", ModelType::Text, true).await.unwrap();
        mirror.record_model_state("b", ModelType::Text, true).await.unwrap();
        mirror.record_model_state("a", ModelType::Text, false).await.unwrap();

        let a = storage.get_system_model("a").unwrap().unwrap();
        let b = storage.get_system_model("b").unwrap().unwrap();
        assert!(a.active && !a.loaded);
        assert!(!b.active && b.loaded);
    }
}
