//! Storage layer for the embeddings service.
//!
//! Provides RocksDB-backed storage with:
//! - Column family isolation per collection (`system_models`, `index_configs`)
//! - JSON documents keyed by their natural key (model name, application id)
//! - Atomic multi-record updates via WriteBatch (active-model switching)

pub mod column_families;
pub mod db;
pub mod error;

pub use db::Storage;
pub use error::StorageError;
