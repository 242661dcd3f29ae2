//! Column family definitions for RocksDB.
//!
//! One column family per collection:
//! - system_models: model records keyed by model name
//! - index_configs: per-application index configs keyed by application id

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for persisted model records
pub const CF_SYSTEM_MODELS: &str = "system_models";

/// Column family name for application index configs
pub const CF_INDEX_CONFIGS: &str = "index_configs";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_SYSTEM_MODELS, CF_INDEX_CONFIGS];

/// Options for small, rewrite-heavy JSON documents
fn document_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    ALL_CF_NAMES
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, document_options()))
        .collect()
}
