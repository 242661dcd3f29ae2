//! # embeddings-types
//!
//! Shared domain types for the embeddings service.
//!
//! This crate defines the data structures passed between the model manager,
//! the document store and the HTTP layer:
//! - Model types and per-model metadata (`ModelType`, `ModelInfo`)
//! - Persisted model records (`SystemModel`)
//! - Per-application index configuration (`ApplicationIndexConfig`)
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use embeddings_types::{ModelType, Settings};
//!
//! let settings = Settings::default();
//! assert_eq!(settings.models.max_resident, 8);
//! assert_eq!("multimodal".parse::<ModelType>().unwrap(), ModelType::Multimodal);
//! ```

pub mod config;
pub mod error;
pub mod index_config;
pub mod model;

pub use config::{ModelSettings, QuerySettings, SearchSettings, Settings};
pub use error::CoreError;
pub use index_config::{ApplicationIndexConfig, IndexConfigFilter, VectorFieldConfig};
pub use model::{ModelInfo, ModelType, SystemModel};
