//! API operations.
//!
//! Each operation is a thin pass-through to the model manager, the query
//! builder or the document store.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use embeddings_models::{ModelManager, QueryEmbedder, QueryEmbeddingRequest, WeightedInputs};
use embeddings_storage::Storage;
use embeddings_types::{
    ApplicationIndexConfig, IndexConfigFilter, ModelInfo, ModelType, Settings, SystemModel,
};

use crate::api::{
    weights_from_map, EmbeddingVector, QueryEmbeddingInput, QueryEmbeddingResult,
    UpsertIndexConfigInput,
};
use crate::error::ServiceError;
use crate::notifier::SearchNotifier;

/// Payload of `/info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service: String,
    pub text_model: String,
    pub alt_large_model: Option<String>,
    pub image_model: String,
}

impl ServiceInfo {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            service: "embeddings".to_string(),
            text_model: settings.models.text_model_name.clone(),
            alt_large_model: settings.models.alt_large_text_model_name.clone(),
            image_model: settings.models.image_model_name.clone(),
        }
    }
}

/// The service facade shared by every route.
pub struct EmbeddingsService {
    manager: Arc<ModelManager>,
    query: QueryEmbedder,
    storage: Arc<Storage>,
    notifier: SearchNotifier,
    info: ServiceInfo,
}

impl EmbeddingsService {
    pub fn new(
        query: QueryEmbedder,
        storage: Arc<Storage>,
        notifier: SearchNotifier,
        info: ServiceInfo,
    ) -> Self {
        Self {
            manager: query.manager().clone(),
            query,
            storage,
            notifier,
            info,
        }
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    pub async fn text_embedding(
        &self,
        text: &str,
        model: Option<&str>,
    ) -> Result<EmbeddingVector, ServiceError> {
        let embedding = self.query.embed_text(text, model).await?;
        Ok(embedding.values.into())
    }

    pub async fn weighted_query_embedding(
        &self,
        weights: &WeightedInputs,
        model: Option<&str>,
    ) -> Result<EmbeddingVector, ServiceError> {
        Ok(self.query.embed_weighted_terms(weights, model).await?.into())
    }

    /// Like `weighted_query_embedding`, from a `{term: weight}` object.
    pub async fn weighted_query_embedding_from_map(
        &self,
        weights_map: &serde_json::Value,
        model: Option<&str>,
    ) -> Result<EmbeddingVector, ServiceError> {
        let weights = weights_from_map(weights_map).ok_or_else(|| {
            ServiceError::InvalidInput("weightsMap must be an object { term: weight }".to_string())
        })?;
        self.weighted_query_embedding(&weights, model).await
    }

    pub async fn image_url_embedding(
        &self,
        image_url: &str,
        model: Option<&str>,
    ) -> Result<EmbeddingVector, ServiceError> {
        let embedding = self.query.embed_image_url(image_url, model).await?;
        Ok(embedding.values.into())
    }

    pub async fn build_query_embedding(
        &self,
        input: QueryEmbeddingInput,
    ) -> Result<QueryEmbeddingResult, ServiceError> {
        let request = QueryEmbeddingRequest::from(input);
        Ok(self.query.build(&request).await?.into())
    }

    pub fn index_config(
        &self,
        application_id: &str,
    ) -> Result<Option<ApplicationIndexConfig>, ServiceError> {
        Ok(self.storage.get_index_config(application_id)?)
    }

    pub fn index_configs(
        &self,
        filter: &IndexConfigFilter,
    ) -> Result<Vec<ApplicationIndexConfig>, ServiceError> {
        Ok(self.storage.find_index_configs(filter)?)
    }

    /// Store a config, then push it to the search service.
    ///
    /// `activeModel` defaults to the configured text model.
    pub async fn upsert_index_config(
        &self,
        input: UpsertIndexConfigInput,
    ) -> Result<ApplicationIndexConfig, ServiceError> {
        let mut config =
            ApplicationIndexConfig::new(input.application_id, input.cluster_id, input.vector_fields);
        config.tenant_id = input.tenant_id;
        config.active_model = Some(
            input
                .active_model
                .unwrap_or_else(|| self.info.text_model.clone()),
        );
        config.schema = input.schema;
        config.services_xml = input.services_xml;
        config.hosts_xml = input.hosts_xml;
        config.autocomplete_paths = input.autocomplete_paths;

        let saved = self.storage.upsert_index_config(&config)?;
        info!(application_id = %saved.application_id, "Upserted index config");
        self.notifier.push_index_config(&saved).await;
        Ok(saved)
    }

    /// Persisted model records.
    pub fn models(&self) -> Result<Vec<SystemModel>, ServiceError> {
        Ok(self.storage.list_system_models()?)
    }

    /// In-memory metadata of every model the manager has seen.
    pub fn loaded_models(&self) -> Vec<ModelInfo> {
        self.manager.list()
    }

    pub async fn load_model(&self, name: &str, model_type: &str) -> Result<SystemModel, ServiceError> {
        self.load_model_advanced(name, model_type, false).await
    }

    /// Load `name` and return its mirrored record, optionally activating it.
    ///
    /// `model_type == "text"` loads with the catalog modality (TEXT when
    /// unknown); anything else uses the catalog modality, defaulting to IMAGE.
    pub async fn load_model_advanced(
        &self,
        name: &str,
        model_type: &str,
        activate: bool,
    ) -> Result<SystemModel, ServiceError> {
        let modality = if model_type == "text" {
            self.manager.get_model_type(name)
        } else {
            self.manager
                .catalog()
                .entry(name)
                .map(|e| e.modality)
                .unwrap_or(ModelType::Image)
        };
        self.manager.get_or_load(name, modality, false).await?;

        if activate {
            return Ok(self.storage.set_active_model(name)?);
        }
        self.storage
            .get_system_model(name)?
            .ok_or_else(|| ServiceError::NotFound(format!("model record {}", name)))
    }

    pub fn set_active_model(&self, name: &str) -> Result<SystemModel, ServiceError> {
        Ok(self.storage.set_active_model(name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use embeddings_models::testing::FakeLoader;
    use embeddings_models::{CatalogEntry, LoadStrategy, ModelCatalog, QueryDefaults};
    use embeddings_types::VectorFieldConfig;
    use tempfile::TempDir;

    use crate::mirror::StorageMirror;

    fn service() -> (EmbeddingsService, Arc<Storage>, TempDir) {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        let catalog = Arc::new(ModelCatalog::new([
            CatalogEntry::new("text-a", ModelType::Text, 4, "a", LoadStrategy::Standard),
            CatalogEntry::new("text-b", ModelType::Text, 4, "b", LoadStrategy::Standard),
            CatalogEntry::new("joint", ModelType::Multimodal, 4, "j", LoadStrategy::Standard),
        ]));
        let manager = Arc::new(
            ModelManager::new(catalog, Arc::new(FakeLoader::new(4)), 4)
                .with_mirror(Arc::new(StorageMirror::new(storage.clone()))),
        );
        let query = QueryEmbedder::new(manager, QueryDefaults::new("text-a", "joint"));
        let info = ServiceInfo {
            service: "embeddings".to_string(),
            text_model: "text-a".to_string(),
            alt_large_model: None,
            image_model: "joint".to_string(),
        };
        let notifier = SearchNotifier::new("http://127.0.0.1:9", Duration::from_millis(100));
        (EmbeddingsService::new(query, storage.clone(), notifier, info), storage, temp)
    }

    #[tokio::test]
    async fn test_text_embedding_mirrors_load() {
        let (service, storage, _temp) = service();

        let vector = service.text_embedding("hello", None).await.unwrap();
        assert_eq!(vector.dimension, 4);
        assert_eq!(vector.values_sample.len(), 4);

        let record = storage.get_system_model("text-a").unwrap().unwrap();
        assert!(record.loaded && record.active);
    }

    #[tokio::test]
    async fn test_weighted_map_rejects_non_object() {
        let (service, _storage, _temp) = service();
        let err = service
            .weighted_query_embedding_from_map(&serde_json::json!([1, 2]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));

        let ok = service
            .weighted_query_embedding_from_map(&serde_json::json!({"shoe": 1.0}), None)
            .await
            .unwrap();
        assert_eq!(ok.dimension, 4);
    }

    #[tokio::test]
    async fn test_load_model_advanced_activates() {
        let (service, _storage, _temp) = service();

        let a = service.load_model("text-a", "text").await.unwrap();
        assert!(a.active);

        let b = service.load_model_advanced("text-b", "text", true).await.unwrap();
        assert!(b.active && b.loaded);

        let active: Vec<String> = service
            .models()
            .unwrap()
            .into_iter()
            .filter(|m| m.active)
            .map(|m| m.name)
            .collect();
        assert_eq!(active, vec!["text-b"]);
    }

    #[tokio::test]
    async fn test_load_model_non_text_uses_catalog_type() {
        let (service, _storage, _temp) = service();
        let record = service.load_model("joint", "image").await.unwrap();
        assert_eq!(record.model_type, ModelType::Multimodal);

        let loaded = service.loaded_models();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].model_type, ModelType::Multimodal);
    }

    #[tokio::test]
    async fn test_upsert_index_config_defaults_active_model() {
        let (service, _storage, _temp) = service();
        let input = UpsertIndexConfigInput {
            application_id: "shop".to_string(),
            tenant_id: None,
            cluster_id: "c1".to_string(),
            active_model: None,
            schema: None,
            services_xml: None,
            hosts_xml: None,
            vector_fields: vec![VectorFieldConfig {
                name: "title".to_string(),
                dimensions: 4,
                weight: 1.0,
            }],
            autocomplete_paths: Vec::new(),
        };

        let saved = service.upsert_index_config(input).await.unwrap();
        assert_eq!(saved.active_model.as_deref(), Some("text-a"));
        assert_eq!(service.index_config("shop").unwrap().unwrap(), saved);
    }

    #[tokio::test]
    async fn test_set_active_unknown_is_not_found() {
        let (service, _storage, _temp) = service();
        let err = service.set_active_model("ghost").unwrap_err();
        assert_eq!(err.status_code().as_u16(), 404);
    }
}
