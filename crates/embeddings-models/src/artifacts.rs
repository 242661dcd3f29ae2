//! Model artifact caching.
//!
//! Downloads model files from HuggingFace Hub into a per-repository
//! directory under the configured cache dir and reuses them afterwards.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::EmbeddingError;

/// Files of a transformers-layout encoder.
pub const ENCODER_FILES: &[&str] = &["config.json", "tokenizer.json", "model.safetensors"];

/// Marker file of a sentence-transformers repository.
pub const SENTENCE_TRANSFORMERS_MODULES: &str = "modules.json";

/// Artifact location for one model repository.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    /// Cache directory path
    pub cache_dir: PathBuf,
    /// Model repository ID
    pub repo_id: String,
    /// Token for gated repositories
    pub token: Option<String>,
}

impl ModelArtifacts {
    /// Create artifacts for `repo_id` under `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>, repo_id: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            repo_id: repo_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Default cache location when none is configured
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("embeddings-service")
            .join("models")
    }

    /// Get the model directory path
    pub fn model_dir(&self) -> PathBuf {
        self.cache_dir.join(self.repo_id.replace('/', "_"))
    }

    /// Check if all given files are cached
    pub fn is_cached(&self, files: &[&str]) -> bool {
        files.iter().all(|f| self.file_path(f).exists())
    }

    /// Get path to a specific model file
    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.model_dir().join(filename)
    }

    /// Get or download every file in `files`, in order.
    pub fn fetch(&self, files: &[&str]) -> Result<Vec<PathBuf>, EmbeddingError> {
        if self.is_cached(files) {
            debug!(path = ?self.model_dir(), "Using cached model files");
        } else {
            info!(repo = %self.repo_id, "Downloading model files...");
            for filename in files {
                if !self.file_path(filename).exists() {
                    self.download(filename)?;
                }
            }
        }
        Ok(files.iter().map(|f| self.file_path(f)).collect())
    }

    /// Get or download a file that the repository may not have.
    ///
    /// A download failure is reported as `None`; callers treat the file as
    /// absent.
    pub fn fetch_optional(&self, filename: &str) -> Option<PathBuf> {
        let path = self.file_path(filename);
        if path.exists() {
            return Some(path);
        }
        match self.download(filename) {
            Ok(()) => Some(path),
            Err(e) => {
                debug!(repo = %self.repo_id, file = filename, error = %e, "Optional file unavailable");
                None
            }
        }
    }

    /// Download a single file from HuggingFace Hub into the model directory
    fn download(&self, filename: &str) -> Result<(), EmbeddingError> {
        use hf_hub::api::sync::ApiBuilder;

        let api = ApiBuilder::new()
            .with_token(self.token.clone())
            .build()
            .map_err(|e| EmbeddingError::Download(e.to_string()))?;
        let repo = api.model(self.repo_id.clone());

        info!(file = filename, "Downloading...");
        let source_path = repo
            .get(filename)
            .map_err(|e| EmbeddingError::Download(format!("{}: {}", filename, e)))?;

        let dest_path = self.file_path(filename);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source_path, &dest_path)?;
        debug!(file = filename, "Downloaded to {:?}", dest_path);

        Ok(())
    }
}

/// Parse a JSON file from a model repository.
pub fn read_json(path: &Path) -> Result<serde_json::Value, EmbeddingError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| EmbeddingError::InvalidInput(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_model_dir_flattens_repo_id() {
        let artifacts = ModelArtifacts::new("/tmp/models", "Marqo/marqo-ecommerce-embeddings-B");
        assert!(artifacts
            .model_dir()
            .ends_with("Marqo_marqo-ecommerce-embeddings-B"));
    }

    #[test]
    fn test_is_cached_empty() {
        let temp = TempDir::new().unwrap();
        let artifacts = ModelArtifacts::new(temp.path(), "test/model");
        assert!(!artifacts.is_cached(ENCODER_FILES));
    }

    #[test]
    fn test_fetch_uses_cached_files() {
        let temp = TempDir::new().unwrap();
        let artifacts = ModelArtifacts::new(temp.path(), "test/model");
        std::fs::create_dir_all(artifacts.model_dir().join("0_CLIPModel")).unwrap();
        for file in ["config.json", "0_CLIPModel/tokenizer.json"] {
            std::fs::write(artifacts.file_path(file), "{}").unwrap();
        }

        let paths = artifacts
            .fetch(&["config.json", "0_CLIPModel/tokenizer.json"])
            .unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[1].ends_with("0_CLIPModel/tokenizer.json"));
    }
}
