//! Model lifecycle manager.
//!
//! Keeps at most `max_resident` handles in memory, evicting the least
//! recently used. A model's metadata says `is_loaded` exactly while a
//! handle for it is resident. Loads are single-flight per identifier: concurrent
//! requests for the same model wait on one async lock and re-check
//! residency once they hold it. Capacity is enforced again at insertion so
//! concurrent loads of different models cannot overshoot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use lru::LruCache;
use tracing::{debug, info, warn};

use embeddings_types::{ModelInfo, ModelType};

use crate::backend::ModelHandle;
use crate::catalog::{CatalogEntry, ModelCatalog};
use crate::compute::{self, ContentBatch};
use crate::error::EmbeddingError;
use crate::image_input::ImageResolver;
use crate::loader::ModelLoader;
use crate::mirror::{NoopMirror, StateMirror};
use crate::model::Embedding;

/// Default number of resident models
pub const DEFAULT_MAX_RESIDENT: usize = 8;

/// Default timeout for remote image fetches
pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(30);

struct ManagerState {
    /// Unbounded; capacity is enforced by the manager before each insert.
    resident: LruCache<String, Arc<ModelHandle>>,
    /// Every model loaded so far; evicted models stay with `is_loaded = false`.
    metadata: HashMap<String, ModelInfo>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            resident: LruCache::unbounded(),
            metadata: HashMap::new(),
        }
    }

    /// Evict until one more model fits. A resident `id` is replaced in
    /// place, so it needs no room.
    fn make_room(&mut self, id: &str, max_resident: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        if self.resident.contains(id) {
            return evicted;
        }
        while self.resident.len() >= max_resident {
            match self.evict_lru() {
                Some(key) => evicted.push(key),
                None => break,
            }
        }
        evicted
    }

    /// Pop the LRU handle and flip its metadata. Returns the evicted key.
    fn evict_lru(&mut self) -> Option<String> {
        let (key, handle) = self.resident.pop_lru()?;
        drop(handle);
        if let Some(info) = self.metadata.get_mut(&key) {
            info.is_loaded = false;
        }
        info!(model = %key, "Evicted least recently used model");
        Some(key)
    }
}

/// Owns resident models and routes embedding requests to them.
pub struct ModelManager {
    catalog: Arc<ModelCatalog>,
    loader: Arc<dyn ModelLoader>,
    mirror: Arc<dyn StateMirror>,
    max_resident: usize,
    state: Mutex<ManagerState>,
    load_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    images: ImageResolver,
}

impl ModelManager {
    pub fn new(catalog: Arc<ModelCatalog>, loader: Arc<dyn ModelLoader>, max_resident: usize) -> Self {
        Self {
            catalog,
            loader,
            mirror: Arc::new(NoopMirror),
            max_resident: max_resident.max(1),
            state: Mutex::new(ManagerState::new()),
            load_locks: DashMap::new(),
            images: ImageResolver::new(DEFAULT_IMAGE_TIMEOUT),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn StateMirror>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn with_image_timeout(mut self, timeout: Duration) -> Self {
        self.images = ImageResolver::new(timeout);
        self
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident
    }

    /// Catalog modality, TEXT for unknown identifiers.
    pub fn get_model_type(&self, id: &str) -> ModelType {
        self.catalog.get_model_type(id)
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure `id` is resident and return its metadata.
    ///
    /// A resident model is touched and returned without a load unless
    /// `force` is set.
    pub async fn get_or_load(
        &self,
        id: &str,
        modality: ModelType,
        force: bool,
    ) -> Result<ModelInfo, EmbeddingError> {
        let handle = self.acquire(id, modality, force).await?;
        Ok(self.info_for(&handle))
    }

    async fn acquire(
        &self,
        id: &str,
        modality: ModelType,
        force: bool,
    ) -> Result<Arc<ModelHandle>, EmbeddingError> {
        let entry = self
            .catalog
            .entry(id)
            .ok_or_else(|| EmbeddingError::UnknownModel(id.to_string()))?
            .clone();

        if !force {
            if let Some(handle) = self.touch(id) {
                return Ok(handle);
            }
        }

        let lock = self
            .load_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if !force {
            if let Some(handle) = self.touch(id) {
                debug!(model = %id, "Model loaded by concurrent request");
                return Ok(handle);
            }
        }

        self.load_and_insert(&entry, modality).await
    }

    async fn load_and_insert(
        &self,
        entry: &CatalogEntry,
        modality: ModelType,
    ) -> Result<Arc<ModelHandle>, EmbeddingError> {
        // Free memory before the load, not just after it. A forced reload
        // keeps the old handle serving until the new one is ready.
        let mut evicted = self.state().make_room(&entry.id, self.max_resident);

        let handle = match self.loader.load(entry, modality).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                warn!(model = %entry.id, error = %e, "Failed loading model");
                self.mirror_evictions(&evicted).await;
                return Err(e);
            }
        };

        {
            let mut state = self.state();
            evicted.extend(state.make_room(&entry.id, self.max_resident));
            state.resident.put(entry.id.clone(), handle.clone());
            state.metadata.insert(
                entry.id.clone(),
                ModelInfo {
                    name: entry.id.clone(),
                    model_type: modality,
                    dimensions: handle.dimensions,
                    is_loaded: true,
                    description: Some(entry.description.clone()),
                },
            );
        }

        info!(
            model = %entry.id,
            modality = %modality,
            dim = handle.dimensions,
            evicted = evicted.len(),
            "Model resident"
        );

        self.mirror_evictions(&evicted).await;
        self.mirror_state(&entry.id, modality, true).await;
        Ok(handle)
    }

    fn touch(&self, id: &str) -> Option<Arc<ModelHandle>> {
        self.state().resident.get(id).cloned()
    }

    fn info_for(&self, handle: &ModelHandle) -> ModelInfo {
        self.state()
            .metadata
            .get(&handle.id)
            .cloned()
            .unwrap_or_else(|| ModelInfo {
                name: handle.id.clone(),
                model_type: handle.modality,
                dimensions: handle.dimensions,
                is_loaded: true,
                description: self.catalog.entry(&handle.id).map(|e| e.description.clone()),
            })
    }

    /// Drop a resident model. Returns whether it was resident.
    ///
    /// The handle's tensors are released once in-flight embedding calls
    /// holding it finish.
    pub async fn unload(&self, id: &str) -> bool {
        let model_type = {
            let mut state = self.state();
            match state.resident.pop(id) {
                Some(handle) => {
                    let model_type = handle.modality;
                    drop(handle);
                    if let Some(info) = state.metadata.get_mut(id) {
                        info.is_loaded = false;
                    }
                    model_type
                }
                None => return false,
            }
        };
        info!(model = %id, "Unloaded model");
        self.mirror_state(id, model_type, false).await;
        true
    }

    /// Snapshot of every known metadata record.
    pub fn list(&self) -> Vec<ModelInfo> {
        let state = self.state();
        let mut infos: Vec<ModelInfo> = state.metadata.values().cloned().collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Resident identifiers from least to most recently used.
    pub fn resident_ids(&self) -> Vec<String> {
        self.state().resident.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    pub fn is_resident(&self, id: &str) -> bool {
        self.state().resident.contains(id)
    }

    /// Embed `items` with model `id`, loading it on demand.
    ///
    /// With `modality == Image` each item is an image URL or base64 payload;
    /// any other modality treats items as text.
    pub async fn embed(
        &self,
        id: &str,
        items: &[String],
        modality: ModelType,
    ) -> Result<Vec<Embedding>, EmbeddingError> {
        if !self.catalog.contains(id) {
            return Err(EmbeddingError::UnknownModel(id.to_string()));
        }
        let handle = self.acquire(id, self.catalog.get_model_type(id), false).await?;

        let content = match modality {
            ModelType::Image => ContentBatch::Images(self.images.resolve_all(items).await?),
            ModelType::Text | ModelType::Multimodal => ContentBatch::Texts(items.to_vec()),
        };

        let model = id.to_string();
        let result = tokio::task::spawn_blocking(move || compute::embed(&handle, &content))
            .await
            .map_err(|e| EmbeddingError::Task(e.to_string()))?;
        if let Err(e) = &result {
            warn!(model = %model, error = %e, "Embedding error");
        }
        result
    }

    /// Push every known metadata record to the mirror.
    pub async fn sync_state_to_mirror(&self) -> Result<(), EmbeddingError> {
        let records: Vec<(String, ModelType, bool)> = self
            .state()
            .metadata
            .values()
            .map(|i| (i.name.clone(), i.model_type, i.is_loaded))
            .collect();

        for (name, model_type, loaded) in &records {
            self.mirror
                .record_model_state(name, *model_type, *loaded)
                .await?;
        }
        debug!(count = records.len(), "Synced model state");
        Ok(())
    }

    async fn mirror_state(&self, name: &str, model_type: ModelType, loaded: bool) {
        if let Err(e) = self.mirror.record_model_state(name, model_type, loaded).await {
            warn!(model = %name, error = %e, "Failed to mirror model state");
        }
    }

    async fn mirror_evictions(&self, evicted: &[String]) {
        for key in evicted {
            let model_type = self
                .state()
                .metadata
                .get(key)
                .map(|i| i.model_type)
                .unwrap_or_else(|| self.catalog.get_model_type(key));
            self.mirror_state(key, model_type, false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, LoadStrategy};
    use crate::testing::{FakeLoader, RecordingMirror};

    fn catalog(ids: &[&str]) -> Arc<ModelCatalog> {
        Arc::new(ModelCatalog::new(ids.iter().map(|id| {
            CatalogEntry::new(*id, ModelType::Text, 4, "test model", LoadStrategy::Standard)
        })))
    }

    #[tokio::test]
    async fn test_load_model_a() {
        let loader = Arc::new(FakeLoader::new(4));
        let manager = ModelManager::new(catalog(&["modelA"]), loader.clone(), 8);

        let info = manager.get_or_load("modelA", ModelType::Text, false).await.unwrap();
        assert_eq!(info.dimensions, 4);
        assert!(info.is_loaded);

        let out = manager
            .embed("modelA", &["hello".to_string()], ModelType::Text)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dimension(), 4);
        assert!((out[0].norm() - 1.0).abs() < 1e-4);
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let manager = ModelManager::new(catalog(&["modelA"]), Arc::new(FakeLoader::new(4)), 8);
        assert_eq!(manager.get_model_type("nope"), ModelType::Text);
        assert!(matches!(
            manager.get_or_load("nope", ModelType::Text, false).await,
            Err(EmbeddingError::UnknownModel(_))
        ));
        assert!(matches!(
            manager.embed("nope", &["x".to_string()], ModelType::Text).await,
            Err(EmbeddingError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let loader = Arc::new(FakeLoader::new(4));
        let manager = ModelManager::new(catalog(&["m1", "m2", "m3"]), loader.clone(), 2);

        for id in ["m1", "m2", "m3"] {
            manager.get_or_load(id, ModelType::Text, false).await.unwrap();
        }
        assert_eq!(manager.resident_ids(), vec!["m2", "m3"]);

        let m1 = manager.list().into_iter().find(|i| i.name == "m1").unwrap();
        assert!(!m1.is_loaded);
    }

    #[tokio::test]
    async fn test_hit_touches_without_loading() {
        let loader = Arc::new(FakeLoader::new(4));
        let manager = ModelManager::new(catalog(&["m1", "m2", "m3"]), loader.clone(), 2);

        manager.get_or_load("m1", ModelType::Text, false).await.unwrap();
        manager.get_or_load("m2", ModelType::Text, false).await.unwrap();
        manager.get_or_load("m1", ModelType::Text, false).await.unwrap();
        assert_eq!(loader.load_count(), 2);

        manager.get_or_load("m3", ModelType::Text, false).await.unwrap();
        assert_eq!(manager.resident_ids(), vec!["m1", "m3"]);
    }

    #[tokio::test]
    async fn test_force_reloads() {
        let loader = Arc::new(FakeLoader::new(4));
        let manager = ModelManager::new(catalog(&["m1"]), loader.clone(), 2);
        manager.get_or_load("m1", ModelType::Text, false).await.unwrap();
        manager.get_or_load("m1", ModelType::Text, true).await.unwrap();
        assert_eq!(loader.load_count(), 2);
        assert_eq!(manager.resident_ids(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_failed_forced_reload_keeps_serving_old_handle() {
        let loader = Arc::new(FakeLoader::new(4).failing_after("m1", 1));
        let mirror = Arc::new(RecordingMirror::default());
        let manager = ModelManager::new(catalog(&["m1"]), loader.clone(), 2)
            .with_mirror(mirror.clone());

        manager.get_or_load("m1", ModelType::Text, false).await.unwrap();
        assert!(matches!(
            manager.get_or_load("m1", ModelType::Text, true).await,
            Err(EmbeddingError::Load { .. })
        ));
        assert_eq!(loader.loads_of("m1"), 2);

        let info = manager.list().into_iter().find(|i| i.name == "m1").unwrap();
        assert_eq!(manager.is_resident("m1"), info.is_loaded);
        assert!(info.is_loaded);
        assert_eq!(mirror.calls(), vec![("m1".to_string(), ModelType::Text, true)]);

        // The old handle still serves requests
        let out = manager
            .embed("m1", &["hello".to_string()], ModelType::Text)
            .await
            .unwrap();
        assert_eq!(out[0].dimension(), 4);
        assert_eq!(loader.loads_of("m1"), 2);
    }

    #[tokio::test]
    async fn test_forced_reload_at_capacity_evicts_nothing() {
        let loader = Arc::new(FakeLoader::new(4));
        let mirror = Arc::new(RecordingMirror::default());
        let manager = ModelManager::new(catalog(&["m1", "m2"]), loader.clone(), 2)
            .with_mirror(mirror.clone());

        manager.get_or_load("m1", ModelType::Text, false).await.unwrap();
        manager.get_or_load("m2", ModelType::Text, false).await.unwrap();
        mirror.clear();

        manager.get_or_load("m1", ModelType::Text, true).await.unwrap();
        assert_eq!(manager.resident_ids(), vec!["m2", "m1"]);
        assert!(manager.list().iter().all(|i| i.is_loaded));
        assert_eq!(mirror.calls(), vec![("m1".to_string(), ModelType::Text, true)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_are_single_flight() {
        let loader = Arc::new(FakeLoader::new(4).with_delay(Duration::from_millis(50)));
        let manager = Arc::new(ModelManager::new(catalog(&["m1"]), loader.clone(), 2));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_or_load("m1", ModelType::Text, false).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_loads_respect_capacity() {
        let loader = Arc::new(FakeLoader::new(4).with_delay(Duration::from_millis(20)));
        let ids = ["a", "b", "c", "d", "e", "f"];
        let manager = Arc::new(ModelManager::new(catalog(&ids), loader.clone(), 2));

        let tasks: Vec<_> = ids
            .iter()
            .map(|id| {
                let manager = manager.clone();
                let id = id.to_string();
                tokio::spawn(async move { manager.get_or_load(&id, ModelType::Text, false).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(manager.resident_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_unload_flips_metadata_and_mirrors() {
        let mirror = Arc::new(RecordingMirror::default());
        let manager = ModelManager::new(catalog(&["m1"]), Arc::new(FakeLoader::new(4)), 2)
            .with_mirror(mirror.clone());

        manager.get_or_load("m1", ModelType::Text, false).await.unwrap();
        assert!(manager.unload("m1").await);
        assert!(!manager.unload("m1").await);
        assert!(!manager.is_resident("m1"));
        assert!(!manager.list()[0].is_loaded);

        assert_eq!(
            mirror.calls(),
            vec![
                ("m1".to_string(), ModelType::Text, true),
                ("m1".to_string(), ModelType::Text, false)
            ]
        );
    }

    #[tokio::test]
    async fn test_mirror_failure_is_swallowed() {
        let mirror = Arc::new(RecordingMirror::failing());
        let manager = ModelManager::new(catalog(&["m1"]), Arc::new(FakeLoader::new(4)), 2)
            .with_mirror(mirror.clone());
        assert!(manager.get_or_load("m1", ModelType::Text, false).await.is_ok());
        assert!(manager.sync_state_to_mirror().await.is_err());
    }

    #[tokio::test]
    async fn test_load_failure_propagates() {
        let loader = Arc::new(FakeLoader::new(4).failing_on("m1"));
        let manager = ModelManager::new(catalog(&["m1"]), loader, 2);
        assert!(matches!(
            manager.get_or_load("m1", ModelType::Text, false).await,
            Err(EmbeddingError::Load { .. })
        ));
        assert!(manager.resident_ids().is_empty());
    }

    #[tokio::test]
    async fn test_sync_state_to_mirror() {
        let mirror = Arc::new(RecordingMirror::default());
        let manager = ModelManager::new(catalog(&["m1", "m2"]), Arc::new(FakeLoader::new(4)), 1)
            .with_mirror(mirror.clone());
        manager.get_or_load("m1", ModelType::Text, false).await.unwrap();
        manager.get_or_load("m2", ModelType::Text, false).await.unwrap();
        mirror.clear();

        manager.sync_state_to_mirror().await.unwrap();
        let mut calls = mirror.calls();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("m1".to_string(), ModelType::Text, false),
                ("m2".to_string(), ModelType::Text, true)
            ]
        );
    }
}
