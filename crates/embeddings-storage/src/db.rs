//! RocksDB wrapper for the embeddings service document store.
//!
//! Provides:
//! - Database open with column family setup
//! - Model record upsert, lookup and active-model switching
//! - Index config upsert, lookup and filtered listing

use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use tracing::{debug, info};

use embeddings_types::{ApplicationIndexConfig, IndexConfigFilter, ModelType, SystemModel};

use crate::column_families::{build_cf_descriptors, CF_INDEX_CONFIGS, CF_SYSTEM_MODELS};
use crate::error::StorageError;

/// Main storage interface
pub struct Storage {
    db: DB,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(2);

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    // ==================== System Model Methods ====================

    /// Insert or replace a model record, stamping `updated_at`.
    pub fn save_system_model(&self, model: &SystemModel) -> Result<SystemModel, StorageError> {
        let mut model = model.clone();
        model.updated_at = chrono::Utc::now();

        let cf = self.cf(CF_SYSTEM_MODELS)?;
        self.db.put_cf(cf, model.name.as_bytes(), model.to_bytes()?)?;
        debug!(model = %model.name, loaded = model.loaded, active = model.active, "Saved model record");
        Ok(model)
    }

    /// Get a model record by name
    pub fn get_system_model(&self, name: &str) -> Result<Option<SystemModel>, StorageError> {
        let cf = self.cf(CF_SYSTEM_MODELS)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => Ok(Some(SystemModel::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All model records, ordered by name
    pub fn list_system_models(&self) -> Result<Vec<SystemModel>, StorageError> {
        let cf = self.cf(CF_SYSTEM_MODELS)?;
        let mut models = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            models.push(SystemModel::from_bytes(&value)?);
        }
        Ok(models)
    }

    /// Active model records, optionally restricted to one type
    pub fn list_active_models(
        &self,
        model_type: Option<ModelType>,
    ) -> Result<Vec<SystemModel>, StorageError> {
        Ok(self
            .list_system_models()?
            .into_iter()
            .filter(|m| m.active && model_type.map_or(true, |t| m.model_type == t))
            .collect())
    }

    /// Upsert the record for `name` with the given loaded flag.
    ///
    /// A new record takes `model_type`; an existing record keeps its type.
    pub fn record_model_state(
        &self,
        name: &str,
        model_type: ModelType,
        loaded: bool,
    ) -> Result<SystemModel, StorageError> {
        let mut model = self
            .get_system_model(name)?
            .unwrap_or_else(|| SystemModel::new(name, model_type));
        model.loaded = loaded;
        self.save_system_model(&model)
    }

    /// Mark `model` active when no model of its type is active yet.
    ///
    /// Returns the stored record, activated or not.
    pub fn ensure_active_if_none(&self, model: &SystemModel) -> Result<SystemModel, StorageError> {
        if !self.list_active_models(Some(model.model_type))?.is_empty() {
            return Ok(model.clone());
        }
        let mut stored = self
            .get_system_model(&model.name)?
            .unwrap_or_else(|| model.clone());
        stored.active = true;
        info!(model = %stored.name, model_type = %stored.model_type, "Activated first model of its type");
        self.save_system_model(&stored)
    }

    /// Make `name` the only active model.
    ///
    /// Clears every active flag, regardless of type, and sets the one for
    /// `name` in a single batch. Fails with `NotFound` before touching
    /// anything when `name` has no record.
    pub fn set_active_model(&self, name: &str) -> Result<SystemModel, StorageError> {
        let target = self
            .get_system_model(name)?
            .ok_or_else(|| StorageError::NotFound(format!("model {}", name)))?;

        let cf = self.cf(CF_SYSTEM_MODELS)?;
        let now = chrono::Utc::now();
        let mut batch = WriteBatch::default();
        for mut model in self.list_system_models()? {
            if model.active && model.name != name {
                model.active = false;
                model.updated_at = now;
                batch.put_cf(cf, model.name.as_bytes(), model.to_bytes()?);
            }
        }

        let mut target = target;
        target.active = true;
        target.updated_at = now;
        batch.put_cf(cf, target.name.as_bytes(), target.to_bytes()?);
        self.db.write(batch)?;

        info!(model = %name, "Set active model");
        Ok(target)
    }

    // ==================== Index Config Methods ====================

    /// Insert or replace the config for its application.
    ///
    /// An existing record keeps its `id` and `created_at`; `updated_at` is
    /// always stamped.
    pub fn upsert_index_config(
        &self,
        config: &ApplicationIndexConfig,
    ) -> Result<ApplicationIndexConfig, StorageError> {
        let mut config = config.clone();
        if let Some(existing) = self.get_index_config(&config.application_id)? {
            config.id = existing.id;
            config.created_at = existing.created_at;
        }
        config.updated_at = chrono::Utc::now();

        let cf = self.cf(CF_INDEX_CONFIGS)?;
        self.db
            .put_cf(cf, config.application_id.as_bytes(), config.to_bytes()?)?;
        debug!(application_id = %config.application_id, "Stored index config");
        Ok(config)
    }

    /// Get the config for an application
    pub fn get_index_config(
        &self,
        application_id: &str,
    ) -> Result<Option<ApplicationIndexConfig>, StorageError> {
        let cf = self.cf(CF_INDEX_CONFIGS)?;
        match self.db.get_cf(cf, application_id.as_bytes())? {
            Some(bytes) => Ok(Some(ApplicationIndexConfig::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Configs matching every set filter field
    pub fn find_index_configs(
        &self,
        filter: &IndexConfigFilter,
    ) -> Result<Vec<ApplicationIndexConfig>, StorageError> {
        let cf = self.cf(CF_INDEX_CONFIGS)?;
        let mut configs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let config = ApplicationIndexConfig::from_bytes(&value)?;
            if filter.matches(&config) {
                configs.push(config);
            }
        }
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_families::ALL_CF_NAMES;
    use embeddings_types::VectorFieldConfig;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    fn index_config(app: &str, tenant: Option<&str>, cluster: &str) -> ApplicationIndexConfig {
        let mut config = ApplicationIndexConfig::new(
            app,
            cluster,
            vec![VectorFieldConfig {
                name: "title".to_string(),
                dimensions: 768,
                weight: 1.0,
            }],
        );
        config.tenant_id = tenant.map(str::to_string);
        config
    }

    #[test]
    fn test_open_creates_column_families() {
        let (storage, _temp) = create_test_storage();
        for cf_name in ALL_CF_NAMES {
            assert!(
                storage.db.cf_handle(cf_name).is_some(),
                "CF {} should exist",
                cf_name
            );
        }
    }

    #[test]
    fn test_save_and_get_system_model() {
        let (storage, _temp) = create_test_storage();
        let model = SystemModel::new("sentence-transformers/all-MiniLM-L6-v2", ModelType::Text);

        let saved = storage.save_system_model(&model).unwrap();
        assert!(saved.updated_at >= model.updated_at);

        let fetched = storage
            .get_system_model("sentence-transformers/all-MiniLM-L6-v2")
            .unwrap()
            .unwrap();
        assert_eq!(fetched, saved);
        assert!(storage.get_system_model("missing").unwrap().is_none());
    }

    #[test]
    fn test_record_model_state_keeps_identity() {
        let (storage, _temp) = create_test_storage();

        let first = storage
            .record_model_state("clip", ModelType::Multimodal, true)
            .unwrap();
        assert!(first.loaded);

        let second = storage
            .record_model_state("clip", ModelType::Image, false)
            .unwrap();
        assert!(!second.loaded);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.model_type, ModelType::Multimodal);
        assert_eq!(storage.list_system_models().unwrap().len(), 1);
    }

    #[test]
    fn test_ensure_active_if_none_activates_first_per_type() {
        let (storage, _temp) = create_test_storage();

        let a = storage.record_model_state("a", ModelType::Text, true).unwrap();
        let a = storage.ensure_active_if_none(&a).unwrap();
        assert!(a.active);

        let b = storage.record_model_state("b", ModelType::Text, true).unwrap();
        let b = storage.ensure_active_if_none(&b).unwrap();
        assert!(!b.active);

        let c = storage.record_model_state("c", ModelType::Image, true).unwrap();
        let c = storage.ensure_active_if_none(&c).unwrap();
        assert!(c.active);

        let active: Vec<String> = storage
            .list_active_models(Some(ModelType::Text))
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(active, vec!["a"]);
        assert_eq!(storage.list_active_models(None).unwrap().len(), 2);
    }

    #[test]
    fn test_set_active_model_is_exclusive() {
        let (storage, _temp) = create_test_storage();
        for (name, t) in [("a", ModelType::Text), ("b", ModelType::Text), ("c", ModelType::Image)] {
            let m = storage.record_model_state(name, t, true).unwrap();
            storage.ensure_active_if_none(&m).unwrap();
        }

        let b = storage.set_active_model("b").unwrap();
        assert!(b.active);

        let active: Vec<String> = storage
            .list_active_models(None)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(active, vec!["b"]);
    }

    #[test]
    fn test_set_active_model_unknown_changes_nothing() {
        let (storage, _temp) = create_test_storage();
        let a = storage.record_model_state("a", ModelType::Text, true).unwrap();
        storage.ensure_active_if_none(&a).unwrap();

        let err = storage.set_active_model("ghost").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(storage.get_system_model("a").unwrap().unwrap().active);
    }

    #[test]
    fn test_upsert_index_config_preserves_creation() {
        let (storage, _temp) = create_test_storage();

        let first = storage
            .upsert_index_config(&index_config("app-1", None, "cluster-a"))
            .unwrap();

        let mut update = index_config("app-1", Some("t1"), "cluster-b");
        update.active_model = Some("modelA".to_string());
        let second = storage.upsert_index_config(&update).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);

        let fetched = storage.get_index_config("app-1").unwrap().unwrap();
        assert_eq!(fetched.cluster_id, "cluster-b");
        assert_eq!(fetched.active_model.as_deref(), Some("modelA"));
        assert!(storage.get_index_config("app-2").unwrap().is_none());
    }

    #[test]
    fn test_find_index_configs_filters() {
        let (storage, _temp) = create_test_storage();
        storage
            .upsert_index_config(&index_config("app-1", Some("t1"), "cluster-a"))
            .unwrap();
        storage
            .upsert_index_config(&index_config("app-2", Some("t2"), "cluster-a"))
            .unwrap();
        storage
            .upsert_index_config(&index_config("app-3", None, "cluster-b"))
            .unwrap();

        let all = storage
            .find_index_configs(&IndexConfigFilter::default())
            .unwrap();
        assert_eq!(all.len(), 3);

        let cluster_a = storage
            .find_index_configs(&IndexConfigFilter {
                cluster_id: Some("cluster-a".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cluster_a.len(), 2);

        let tenant = storage
            .find_index_configs(&IndexConfigFilter {
                tenant_id: Some("t2".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tenant.len(), 1);
        assert_eq!(tenant[0].application_id, "app-2");
    }
}
