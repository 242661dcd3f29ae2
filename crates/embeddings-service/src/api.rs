//! Request and response bodies (camelCase JSON).

use serde::{Deserialize, Serialize};

use embeddings_models::query::{Contribution, QueryEmbedding, SAMPLE_LEN};
use embeddings_models::{QueryEmbeddingRequest, WeightedInputs};
use embeddings_types::VectorFieldConfig;

fn default_weight() -> f32 {
    1.0
}

fn default_model_type() -> String {
    "text".to_string()
}

/// A plain vector with a short preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingVector {
    pub dimension: usize,
    pub values: Vec<f32>,
    pub values_sample: Vec<f32>,
}

impl From<Vec<f32>> for EmbeddingVector {
    fn from(values: Vec<f32>) -> Self {
        Self {
            dimension: values.len(),
            values_sample: values.iter().take(SAMPLE_LEN).copied().collect(),
            values,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEmbeddingRequest {
    pub text: String,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TermWeight {
    pub term: String,
    pub weight: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedQueryRequest {
    pub weights: Vec<TermWeight>,
    #[serde(default)]
    pub model_name: Option<String>,
}

/// `weightsMap` is validated by the service: it must be an object of numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedMapRequest {
    pub weights_map: serde_json::Value,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUrlRequest {
    pub image_url: String,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightedText {
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedImage {
    pub image_url: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

/// Combined query request as sent over the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEmbeddingInput {
    #[serde(default)]
    pub terms: Option<Vec<TermWeight>>,
    #[serde(default)]
    pub weighted_texts: Option<Vec<WeightedText>>,
    #[serde(default)]
    pub weighted_images: Option<Vec<WeightedImage>>,
    #[serde(default)]
    pub text_model_name: Option<String>,
    #[serde(default)]
    pub image_model_name: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub normalize: Option<bool>,
}

impl From<QueryEmbeddingInput> for QueryEmbeddingRequest {
    fn from(input: QueryEmbeddingInput) -> Self {
        QueryEmbeddingRequest {
            term_weights: input
                .terms
                .map(|t| t.into_iter().map(|t| (t.term, t.weight)).collect()),
            weighted_texts: input
                .weighted_texts
                .map(|t| t.into_iter().map(|t| (t.text, t.weight)).collect()),
            weighted_images: input
                .weighted_images
                .map(|i| i.into_iter().map(|i| (i.image_url, i.weight)).collect()),
            text_model: input.text_model_name,
            image_model: input.image_model_name,
            strategy: input.strategy,
            normalize: input.normalize,
        }
    }
}

/// Combined query vector with provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEmbeddingResult {
    pub dimension: usize,
    pub vector: Vec<f32>,
    pub strategy: String,
    pub components: Vec<Contribution>,
    pub values_sample: Vec<f32>,
}

impl From<QueryEmbedding> for QueryEmbeddingResult {
    fn from(q: QueryEmbedding) -> Self {
        Self {
            dimension: q.dimension,
            values_sample: q.vector.iter().take(SAMPLE_LEN).copied().collect(),
            vector: q.vector,
            strategy: q.strategy,
            components: q.components,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertIndexConfigInput {
    pub application_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub cluster_id: String,
    #[serde(default)]
    pub active_model: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub services_xml: Option<String>,
    #[serde(default)]
    pub hosts_xml: Option<String>,
    pub vector_fields: Vec<VectorFieldConfig>,
    #[serde(default)]
    pub autocomplete_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadModelRequest {
    pub name: String,
    #[serde(rename = "type", default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub activate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetActiveModelRequest {
    pub name: String,
}

/// Parse `{term: weight}`; every value must be a number.
///
/// Terms keep request order (serde_json `preserve_order`).
pub fn weights_from_map(value: &serde_json::Value) -> Option<WeightedInputs> {
    let object = value.as_object()?;
    object
        .iter()
        .map(|(k, v)| v.as_f64().map(|w| (k.clone(), w as f32)))
        .collect::<Option<Vec<_>>>()
        .map(|pairs| pairs.into_iter().collect())
}
