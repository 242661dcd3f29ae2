//! Per-application index configuration.
//!
//! Stored by the document store and pushed to the search subsystem after
//! every upsert. The vector field list tells ingestion which document fields
//! to embed and how to weight them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One vector field of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorFieldConfig {
    /// Document field name
    pub name: String,
    /// Vector dimensionality
    pub dimensions: usize,
    /// Contribution weight
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 {
    1.0
}

/// Index configuration for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationIndexConfig {
    /// Record identifier (ULID)
    pub id: String,
    /// Owning application, unique per record
    pub application_id: String,
    /// Optional tenant
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Search cluster the index lives in
    pub cluster_id: String,
    /// Text model used for this index
    #[serde(default)]
    pub active_model: Option<String>,
    /// Stored search schema definition
    #[serde(default)]
    pub schema: Option<String>,
    /// Backup of generated services.xml
    #[serde(default)]
    pub services_xml: Option<String>,
    /// Backup of generated hosts.xml
    #[serde(default)]
    pub hosts_xml: Option<String>,
    /// Vector fields
    pub vector_fields: Vec<VectorFieldConfig>,
    /// Document paths concatenated into autocomplete suggestions
    #[serde(default)]
    pub autocomplete_paths: Vec<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

impl ApplicationIndexConfig {
    /// Create a config with fresh id and timestamps.
    pub fn new(
        application_id: impl Into<String>,
        cluster_id: impl Into<String>,
        vector_fields: Vec<VectorFieldConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            application_id: application_id.into(),
            tenant_id: None,
            cluster_id: cluster_id.into(),
            active_model: None,
            schema: None,
            services_xml: None,
            hosts_xml: None,
            vector_fields,
            autocomplete_paths: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(CoreError::from)
    }

    /// Deserialize from JSON bytes, dropping legacy fields.
    ///
    /// Older records carried `termWeights` and `indexSchema`; unknown fields
    /// are ignored so those records still load.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(CoreError::from)
    }
}

/// Optional filters for listing index configs. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfigFilter {
    pub application_id: Option<String>,
    pub tenant_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl IndexConfigFilter {
    /// Whether a config satisfies every set filter.
    pub fn matches(&self, config: &ApplicationIndexConfig) -> bool {
        let app_ok = self
            .application_id
            .as_ref()
            .map_or(true, |a| *a == config.application_id);
        let tenant_ok = self
            .tenant_id
            .as_ref()
            .map_or(true, |t| config.tenant_id.as_ref() == Some(t));
        let cluster_ok = self
            .cluster_id
            .as_ref()
            .map_or(true, |c| *c == config.cluster_id);
        app_ok && tenant_ok && cluster_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ApplicationIndexConfig {
        ApplicationIndexConfig::new(
            "app-1",
            "cluster-a",
            vec![VectorFieldConfig {
                name: "title".to_string(),
                dimensions: 768,
                weight: 1.0,
            }],
        )
    }

    #[test]
    fn test_legacy_fields_are_ignored() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["termWeights"] = serde_json::json!({"shoe": 1.0});
        value["indexSchema"] = serde_json::json!("old");
        let bytes = serde_json::to_vec(&value).unwrap();

        let decoded = ApplicationIndexConfig::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.application_id, "app-1");
    }

    #[test]
    fn test_vector_field_weight_defaults_to_one() {
        let field: VectorFieldConfig =
            serde_json::from_str(r#"{"name":"body","dimensions":512}"#).unwrap();
        assert!((field.weight - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_filter_matches() {
        let mut config = sample();
        config.tenant_id = Some("t1".to_string());

        assert!(IndexConfigFilter::default().matches(&config));

        let by_tenant = IndexConfigFilter {
            tenant_id: Some("t1".to_string()),
            ..Default::default()
        };
        assert!(by_tenant.matches(&config));

        let other_cluster = IndexConfigFilter {
            cluster_id: Some("cluster-b".to_string()),
            ..Default::default()
        };
        assert!(!other_cluster.matches(&config));
    }
}
