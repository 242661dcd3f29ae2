//! Configuration loading for the embeddings service.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/embeddings-service/config.toml.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::CoreError;

/// Model manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Maximum number of models resident in memory at once.
    #[serde(default = "default_max_resident")]
    pub max_resident: usize,

    /// Directory where downloaded model artifacts are kept.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Default text model identifier.
    #[serde(default = "default_text_model_name")]
    pub text_model_name: String,

    /// Larger alternative text model, reported by /info only.
    #[serde(default = "default_alt_large_text_model_name")]
    pub alt_large_text_model_name: Option<String>,

    /// Default image model identifier.
    #[serde(default = "default_image_model_name")]
    pub image_model_name: String,

    /// Embed images with the text model when it is a known multimodal model.
    #[serde(default)]
    pub use_text_model_for_images: bool,

    /// Compute device: cpu, cuda, cuda:N, metal or auto.
    #[serde(default = "default_device")]
    pub device: String,

    /// Token for gated HuggingFace repositories (loaded from env, not stored in config file)
    #[serde(default)]
    pub huggingface_token: Option<String>,

    /// Timeout for fetching remote images (seconds).
    #[serde(default = "default_image_fetch_timeout")]
    pub image_fetch_timeout_secs: u64,
}

fn default_max_resident() -> usize {
    8
}

fn default_cache_dir() -> String {
    ".models-cache".to_string()
}

fn default_text_model_name() -> String {
    "Marqo/marqo-ecommerce-embeddings-B".to_string()
}

fn default_alt_large_text_model_name() -> Option<String> {
    Some("Marqo/marqo-ecommerce-embeddings-L".to_string())
}

fn default_image_model_name() -> String {
    "sentence-transformers/clip-ViT-B-32".to_string()
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_image_fetch_timeout() -> u64 {
    30
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            max_resident: default_max_resident(),
            cache_dir: default_cache_dir(),
            text_model_name: default_text_model_name(),
            alt_large_text_model_name: default_alt_large_text_model_name(),
            image_model_name: default_image_model_name(),
            use_text_model_for_images: false,
            device: default_device(),
            huggingface_token: None,
            image_fetch_timeout_secs: default_image_fetch_timeout(),
        }
    }
}

/// Query embedding defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Strategy used when a request does not name one (WEIGHTED_SUM or MEAN)
    #[serde(default = "default_query_strategy")]
    pub default_strategy: String,

    /// Normalize combined query vectors unless the request says otherwise
    #[serde(default = "default_true")]
    pub normalize: bool,
}

fn default_query_strategy() -> String {
    "WEIGHTED_SUM".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_strategy: default_query_strategy(),
            normalize: true,
        }
    }
}

/// Search subsystem notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Base URL of the search service
    #[serde(default = "default_search_service_url")]
    pub service_url: String,

    /// Timeout for index-config pushes (seconds)
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

fn default_search_service_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_search_timeout() -> u64 {
    10
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            service_url: default_search_service_url(),
            timeout_secs: default_search_timeout(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Model manager configuration
    #[serde(default)]
    pub models: ModelSettings,

    /// Query embedding defaults
    #[serde(default)]
    pub query: QuerySettings,

    /// Search subsystem configuration
    #[serde(default)]
    pub search: SearchSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "embeddings-service")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8090
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            http_host: default_http_host(),
            http_port: default_http_port(),
            log_level: default_log_level(),
            models: ModelSettings::default(),
            query: QuerySettings::default(),
            search: SearchSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/embeddings-service/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (EMBEDDINGS_*, nested keys joined by `__`)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, CoreError> {
        let config_dir = ProjectDirs::from("", "", "embeddings-service")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            // 1. Built-in defaults
            .set_default("db_path", default_db_path())
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("http_host", default_http_host())
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("http_port", default_http_port() as i64)
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("models.max_resident", default_max_resident() as i64)
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("models.text_model_name", default_text_model_name())
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("models.image_model_name", default_image_model_name())
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("models.device", default_device())
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("query.default_strategy", default_query_strategy())
            .map_err(|e| CoreError::Config(e.to_string()))?
            .set_default("search.service_url", default_search_service_url())
            .map_err(|e| CoreError::Config(e.to_string()))?
            // 2. Default config file
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        // 3. CLI-specified config file (higher precedence than default)
        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // 4. Environment variables (highest precedence before CLI flags)
        // Format: EMBEDDINGS_HTTP_PORT, EMBEDDINGS_MODELS__MAX_RESIDENT, etc.
        builder = builder.add_source(
            Environment::with_prefix("EMBEDDINGS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.models.max_resident == 0 {
            return Err(CoreError::Config(
                "models.max_resident must be > 0".to_string(),
            ));
        }
        if !is_valid_device(&self.models.device) {
            return Err(CoreError::Config(format!(
                "models.device must be cpu, cuda, cuda:N, metal or auto, got '{}'",
                self.models.device
            )));
        }
        Ok(())
    }

    /// Get the socket address for the HTTP server
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Expand ~ in db_path to actual home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }

    /// Expand ~ in the model cache directory
    pub fn expanded_cache_dir(&self) -> PathBuf {
        expand_home(&self.models.cache_dir)
    }
}

fn is_valid_device(device: &str) -> bool {
    match device {
        "cpu" | "cuda" | "metal" | "auto" => true,
        other => other
            .strip_prefix("cuda:")
            .is_some_and(|ordinal| ordinal.parse::<usize>().is_ok()),
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
