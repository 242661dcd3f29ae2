//! Model types and model records.
//!
//! `ModelInfo` is the in-memory metadata the model manager keeps for every
//! model it has seen; `SystemModel` is the persisted mirror of that state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Content modality a model handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Text-only encoder
    #[default]
    Text,
    /// Image encoder
    Image,
    /// Joint text/image encoder
    Multimodal,
}

impl ModelType {
    /// Lowercase name used in persisted records and API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Text => "text",
            ModelType::Image => "image",
            ModelType::Multimodal => "multimodal",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(ModelType::Text),
            "image" => Ok(ModelType::Image),
            "multimodal" => Ok(ModelType::Multimodal),
            other => Err(CoreError::InvalidInput(format!(
                "unknown model type '{}'",
                other
            ))),
        }
    }
}

/// Metadata for a model known to the manager.
///
/// Survives eviction: `is_loaded` flips to false but the record stays
/// listable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Catalog identifier
    pub name: String,
    /// Modality the model was loaded for
    #[serde(rename = "type")]
    pub model_type: ModelType,
    /// Output dimensionality of the resident handle
    pub dimensions: usize,
    /// Whether a handle is currently resident
    pub is_loaded: bool,
    /// Human description from the catalog
    #[serde(default)]
    pub description: Option<String>,
}

/// Persisted model record (the `system_models` collection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemModel {
    /// Record identifier (ULID)
    pub id: String,
    /// Model identifier, unique per record
    pub name: String,
    /// Model type
    #[serde(rename = "type")]
    pub model_type: ModelType,
    /// Whether this model is the active one
    #[serde(default)]
    pub active: bool,
    /// Whether the model is resident in the service
    #[serde(default)]
    pub loaded: bool,
    /// Optional version tag
    #[serde(default)]
    pub version: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

impl SystemModel {
    /// Create a new, inactive and unloaded record.
    pub fn new(name: impl Into<String>, model_type: ModelType) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            name: name.into(),
            model_type,
            active: false,
            loaded: false,
            version: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(CoreError::from)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(CoreError::from)
    }
}
