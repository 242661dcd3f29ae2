//! Model loading strategies.
//!
//! The strategy comes from the catalog entry and the requested modality:
//! - TEXT: direct sentence encoder, falling back to tokenizer + encoder with
//!   mean pooling. The fallback's width is probed with a dummy input.
//! - non-TEXT, open_clip: dual-tower encoder. No fallback.
//! - non-TEXT, joint-processor: joint model with processor config. No fallback.
//! - non-TEXT, standard: direct sentence encoder.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use candle_core::Device;
use tracing::{info, warn};

use embeddings_types::ModelType;

use crate::artifacts::{read_json, ModelArtifacts, ENCODER_FILES, SENTENCE_TRANSFORMERS_MODULES};
use crate::backend::{ModelBackend, ModelHandle, SentenceEncoder};
use crate::bert::{BertSentenceEncoder, BertTokenEncoder, MAX_SEQ_LENGTH};
use crate::catalog::{CatalogEntry, LoadStrategy};
use crate::clip::{self, ClipSentenceEncoder};
use crate::compute::{self, ContentBatch};
use crate::error::EmbeddingError;
use crate::open_clip;
use crate::tokenizer::HfTokenizer;

/// Dummy input forwarded to measure a fallback encoder's width.
pub const TEXT_PROBE: &str = "test";

/// Dummy input encoded to measure a dual encoder's projection width.
pub const DUAL_PROBE: &str = "dimension probe";

/// Turns a catalog entry into a resident handle.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, entry: &CatalogEntry, modality: ModelType) -> Result<ModelHandle, EmbeddingError>;
}

/// Loads models from HuggingFace Hub into candle.
#[derive(Debug, Clone)]
pub struct CandleModelLoader {
    cache_dir: PathBuf,
    device: Device,
    token: Option<String>,
}

impl CandleModelLoader {
    pub fn new(cache_dir: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            device,
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn artifacts(&self, id: &str) -> ModelArtifacts {
        ModelArtifacts::new(&self.cache_dir, id).with_token(self.token.clone())
    }

    /// Synchronous load; downloads and weight mapping block.
    pub fn load_blocking(
        &self,
        entry: &CatalogEntry,
        modality: ModelType,
    ) -> Result<ModelHandle, EmbeddingError> {
        let start = Instant::now();
        let handle = match (modality, entry.strategy) {
            (ModelType::Text, _) => self.load_text(entry, modality),
            (_, LoadStrategy::OpenClip) => self.load_open_clip(entry, modality),
            (_, LoadStrategy::JointProcessor) => self.load_joint(entry, modality),
            (_, LoadStrategy::Standard) => self
                .load_direct(entry, modality)
                .map_err(|e| EmbeddingError::load(&entry.id, e)),
        }?;

        info!(
            model = %entry.id,
            backend = handle.backend.kind(),
            dim = handle.dimensions,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model loaded"
        );
        Ok(handle)
    }

    fn load_text(&self, entry: &CatalogEntry, modality: ModelType) -> Result<ModelHandle, EmbeddingError> {
        match self.load_direct(entry, modality) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(
                    model = %entry.id,
                    error = %e,
                    "Sentence encoder load failed, falling back to tokenizer with mean pooling"
                );
                self.load_mean_pool(entry, modality)
                    .map_err(|e| EmbeddingError::load(&entry.id, e))
            }
        }
    }

    /// Direct encoder, picked from the repository's module layout.
    fn load_direct(&self, entry: &CatalogEntry, modality: ModelType) -> Result<ModelHandle, EmbeddingError> {
        let artifacts = self.artifacts(&entry.id);
        let encoder: Box<dyn SentenceEncoder> = match DirectLayout::detect(&artifacts)? {
            DirectLayout::Bert => Box::new(BertSentenceEncoder::load(&artifacts, &self.device)?),
            DirectLayout::Clip { module_dir } => Box::new(ClipSentenceEncoder::load(
                &artifacts,
                &module_dir,
                &self.device,
            )?),
        };
        let dimensions = encoder.dimensions();
        Ok(ModelHandle::new(
            &entry.id,
            modality,
            dimensions,
            self.device.clone(),
            ModelBackend::DirectEncoder(encoder),
        ))
    }

    fn load_mean_pool(&self, entry: &CatalogEntry, modality: ModelType) -> Result<ModelHandle, EmbeddingError> {
        let artifacts = self.artifacts(&entry.id);
        let paths = artifacts.fetch(ENCODER_FILES)?;
        let encoder = BertTokenEncoder::load_from_paths(&paths[0], &paths[2], &self.device)?;
        let tokenizer = HfTokenizer::from_file(&paths[1], MAX_SEQ_LENGTH)?;

        let mut handle = ModelHandle::new(
            &entry.id,
            modality,
            encoder.hidden_size(),
            self.device.clone(),
            ModelBackend::TokenizerMeanPool {
                tokenizer: Box::new(tokenizer),
                encoder: Box::new(encoder),
            },
        );
        // Hidden-state width is authoritative for the pooled output.
        handle.dimensions = probe_dimensions(&handle, TEXT_PROBE)?;
        Ok(handle)
    }

    fn load_open_clip(&self, entry: &CatalogEntry, modality: ModelType) -> Result<ModelHandle, EmbeddingError> {
        let hub_name = format!("hf-hub:{}", entry.id);
        let parts = open_clip::load_open_clip(&self.artifacts(&entry.id), &self.device).map_err(|e| {
            EmbeddingError::load(&entry.id, format!("{} via open_clip: {}", hub_name, e))
        })?;

        let handle = ModelHandle::new(
            &entry.id,
            modality,
            entry.dimensions,
            self.device.clone(),
            ModelBackend::DualEncoderOpen {
                tokenizer: Box::new(parts.tokenizer),
                preprocessor: parts.preprocessor,
                towers: parts.towers,
            },
        );
        Ok(with_probed_dimensions(handle))
    }

    fn load_joint(&self, entry: &CatalogEntry, modality: ModelType) -> Result<ModelHandle, EmbeddingError> {
        let parts = clip::load_joint(&self.artifacts(&entry.id), &self.device)
            .map_err(|e| EmbeddingError::load(&entry.id, e))?;

        let handle = ModelHandle::new(
            &entry.id,
            modality,
            entry.dimensions,
            self.device.clone(),
            ModelBackend::DualEncoderAuto {
                tokenizer: Box::new(parts.tokenizer),
                preprocessor: parts.preprocessor,
                model: Box::new(parts.model),
            },
        );
        Ok(with_probed_dimensions(handle))
    }
}

#[async_trait]
impl ModelLoader for CandleModelLoader {
    async fn load(&self, entry: &CatalogEntry, modality: ModelType) -> Result<ModelHandle, EmbeddingError> {
        let loader = self.clone();
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || loader.load_blocking(&entry, modality))
            .await
            .map_err(|e| EmbeddingError::Task(e.to_string()))?
    }
}

/// Width of the vector produced for a single text input.
pub fn probe_dimensions(handle: &ModelHandle, probe: &str) -> Result<usize, EmbeddingError> {
    compute::embed(handle, &ContentBatch::Texts(vec![probe.to_string()]))?
        .first()
        .map(|e| e.dimension())
        .ok_or_else(|| EmbeddingError::InvalidInput("probe produced no output".to_string()))
}

/// Replace catalog dims with the probed width; keep them if probing fails.
fn with_probed_dimensions(mut handle: ModelHandle) -> ModelHandle {
    match probe_dimensions(&handle, DUAL_PROBE) {
        Ok(dims) => handle.dimensions = dims,
        Err(e) => warn!(
            model = %handle.id,
            dim = handle.dimensions,
            error = %e,
            "Could not probe dimension, using catalog value"
        ),
    }
    handle
}

/// Repository layouts the direct encoder understands.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DirectLayout {
    Bert,
    Clip { module_dir: String },
}

impl DirectLayout {
    /// Inspect `modules.json` (sentence-transformers) or the root
    /// `config.json` (plain transformers CLIP).
    fn detect(artifacts: &ModelArtifacts) -> Result<Self, EmbeddingError> {
        if let Some(path) = artifacts.fetch_optional(SENTENCE_TRANSFORMERS_MODULES) {
            return Self::from_modules(&read_json(&path)?);
        }
        let config = artifacts.fetch(&["config.json"])?;
        match read_json(&config[0])?.get("model_type").and_then(|v| v.as_str()) {
            Some("clip") => Ok(DirectLayout::Clip {
                module_dir: String::new(),
            }),
            other => Err(EmbeddingError::InvalidInput(format!(
                "{} is not a sentence-transformers repository (model_type {:?})",
                artifacts.repo_id, other
            ))),
        }
    }

    fn from_modules(modules: &serde_json::Value) -> Result<Self, EmbeddingError> {
        let first = modules
            .as_array()
            .and_then(|m| m.first())
            .ok_or_else(|| EmbeddingError::InvalidInput("empty modules.json".to_string()))?;
        let kind = first.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        let path = first.get("path").and_then(|v| v.as_str()).unwrap_or_default();

        if kind.ends_with("CLIPModel") {
            Ok(DirectLayout::Clip {
                module_dir: path.to_string(),
            })
        } else if kind.ends_with("Transformer") {
            Ok(DirectLayout::Bert)
        } else {
            Err(EmbeddingError::InvalidInput(format!(
                "unsupported sentence-transformers module '{}'",
                kind
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_from_modules() {
        let clip = serde_json::json!([
            {"idx": 0, "name": "0", "path": "0_CLIPModel", "type": "sentence_transformers.models.CLIPModel"}
        ]);
        assert_eq!(
            DirectLayout::from_modules(&clip).unwrap(),
            DirectLayout::Clip {
                module_dir: "0_CLIPModel".to_string()
            }
        );

        let bert = serde_json::json!([
            {"idx": 0, "name": "0", "path": "", "type": "sentence_transformers.models.Transformer"},
            {"idx": 1, "name": "1", "path": "1_Pooling", "type": "sentence_transformers.models.Pooling"}
        ]);
        assert_eq!(DirectLayout::from_modules(&bert).unwrap(), DirectLayout::Bert);
        assert!(DirectLayout::from_modules(&serde_json::json!([])).is_err());
    }

    #[test]
    fn test_layout_detect_reads_cached_modules() {
        let temp = TempDir::new().unwrap();
        let artifacts = ModelArtifacts::new(temp.path(), "local/clip");
        std::fs::create_dir_all(artifacts.model_dir()).unwrap();
        std::fs::write(
            artifacts.file_path(SENTENCE_TRANSFORMERS_MODULES),
            r#"[{"path":"","type":"sentence_transformers.models.CLIPModel"}]"#,
        )
        .unwrap();

        assert_eq!(
            DirectLayout::detect(&artifacts).unwrap(),
            DirectLayout::Clip {
                module_dir: String::new()
            }
        );
    }

    #[tokio::test]
    #[ignore = "requires model download"]
    async fn test_load_minilm_text() {
        let temp = TempDir::new().unwrap();
        let loader = CandleModelLoader::new(temp.path(), Device::Cpu);
        let entry = CatalogEntry::new(
            "sentence-transformers/all-MiniLM-L6-v2",
            ModelType::Text,
            768,
            "",
            LoadStrategy::Standard,
        );
        let handle = loader.load(&entry, ModelType::Text).await.unwrap();
        assert_eq!(handle.dimensions, 384);
        assert_eq!(handle.backend.kind(), "direct");
    }

    #[tokio::test]
    #[ignore = "requires model download"]
    async fn test_load_marqo_siglip() {
        let temp = TempDir::new().unwrap();
        let loader = CandleModelLoader::new(temp.path(), Device::Cpu);
        let entry = CatalogEntry::new(
            "Marqo/marqo-ecommerce-embeddings-B",
            ModelType::Multimodal,
            768,
            "",
            LoadStrategy::OpenClip,
        );
        let handle = loader.load(&entry, ModelType::Multimodal).await.unwrap();
        assert_eq!(handle.dimensions, 768);
        assert_eq!(handle.backend.kind(), "open_clip");

        let texts = compute::embed(&handle, &ContentBatch::Texts(vec!["red running shoe".to_string()])).unwrap();
        let image = image::DynamicImage::new_rgb8(300, 200);
        let images = compute::embed(&handle, &ContentBatch::Images(vec![image])).unwrap();
        assert_eq!(texts[0].values.len(), 768);
        assert_eq!(images[0].values.len(), 768);
    }
}
