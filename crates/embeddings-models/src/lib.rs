//! # embeddings-models
//!
//! Model lifecycle and embedding computation using Candle.
//!
//! - `ModelCatalog`: static table of known models and how to load them
//! - `ModelManager`: bounded LRU of resident models with single-flight loads
//! - `compute::embed`: unified text/image embedding over every backend
//! - `QueryEmbedder`: weighted multi-input query vectors
//!
//! Weights come from the Hugging Face Hub and are cached locally; nothing
//! calls an external inference API.

pub mod artifacts;
pub mod backend;
pub mod bert;
pub mod catalog;
pub mod clip;
pub mod compute;
pub mod device;
pub mod error;
pub mod image_input;
pub mod loader;
pub mod manager;
pub mod mirror;
pub mod model;
pub mod open_clip;
pub mod pooling;
pub mod query;
pub mod siglip;
pub mod tokenizer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use artifacts::ModelArtifacts;
pub use backend::{ModelBackend, ModelHandle};
pub use catalog::{CatalogEntry, LoadStrategy, ModelCatalog};
pub use compute::ContentBatch;
pub use device::select_device;
pub use error::EmbeddingError;
pub use image_input::{ImagePreprocessor, ImageResolver, ImageSource};
pub use loader::{CandleModelLoader, ModelLoader};
pub use manager::{ModelManager, DEFAULT_IMAGE_TIMEOUT, DEFAULT_MAX_RESIDENT};
pub use mirror::{NoopMirror, StateMirror};
pub use model::Embedding;
pub use query::{
    CombineStrategy, Contribution, ContributionKind, QueryDefaults, QueryEmbedder, QueryEmbedding,
    QueryEmbeddingRequest, WeightedInputs,
};
