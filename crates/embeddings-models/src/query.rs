//! Query embedding construction.
//!
//! Combines weighted contributions (a term aggregate, individual texts and
//! individual images) into one vector. Each contribution is recorded with a
//! short sample of its vector so callers can see what went into a query.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use embeddings_types::{ModelType, QuerySettings};

use crate::error::EmbeddingError;
use crate::manager::ModelManager;
use crate::model::Embedding;

/// Leading components kept per contribution record.
pub const SAMPLE_LEN: usize = 8;

/// Characters of a text kept as its contribution key.
pub const TEXT_KEY_LEN: usize = 64;

/// How contributions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineStrategy {
    /// Weight-scaled sum
    WeightedSum,
    /// Weighted arithmetic mean
    Mean,
}

impl CombineStrategy {
    /// `MEAN` selects the mean; every other name is a weighted sum.
    pub fn from_name(name: &str) -> Self {
        if name == "MEAN" {
            CombineStrategy::Mean
        } else {
            CombineStrategy::WeightedSum
        }
    }
}

/// Kind of a contribution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionKind {
    TermAgg,
    Text,
    Image,
}

/// Provenance of one combined vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    #[serde(rename = "type")]
    pub kind: ContributionKind,
    pub weight: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    pub sample: Vec<f32>,
}

/// Ordered `(key, weight)` pairs with mapping semantics: a repeated key
/// keeps its first position and takes its last weight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightedInputs {
    entries: Vec<(String, f32)>,
}

impl WeightedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, weight: f32) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = weight,
            None => self.entries.push((key, weight)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(k, w)| (k.as_str(), *w))
    }
}

impl<K: Into<String>> FromIterator<(K, f32)> for WeightedInputs {
    fn from_iter<I: IntoIterator<Item = (K, f32)>>(iter: I) -> Self {
        let mut inputs = WeightedInputs::new();
        for (k, w) in iter {
            inputs.insert(k, w);
        }
        inputs
    }
}

/// A query embedding request.
#[derive(Debug, Clone, Default)]
pub struct QueryEmbeddingRequest {
    pub term_weights: Option<WeightedInputs>,
    pub weighted_texts: Option<WeightedInputs>,
    /// Keys are image URLs or base64 payloads
    pub weighted_images: Option<WeightedInputs>,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    /// Echoed back verbatim; defaults to the configured strategy
    pub strategy: Option<String>,
    pub normalize: Option<bool>,
}

/// A combined query vector with provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEmbedding {
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub strategy: String,
    pub components: Vec<Contribution>,
}

/// Default models for query building.
#[derive(Debug, Clone)]
pub struct QueryDefaults {
    pub text_model: String,
    pub image_model: String,
    pub use_text_model_for_images: bool,
    pub strategy: String,
    pub normalize: bool,
}

impl QueryDefaults {
    pub fn new(text_model: impl Into<String>, image_model: impl Into<String>) -> Self {
        let query = QuerySettings::default();
        Self {
            text_model: text_model.into(),
            image_model: image_model.into(),
            use_text_model_for_images: false,
            strategy: query.default_strategy,
            normalize: query.normalize,
        }
    }
}

/// Builds text, term-aggregate, image and combined query embeddings.
pub struct QueryEmbedder {
    manager: Arc<ModelManager>,
    defaults: QueryDefaults,
}

impl QueryEmbedder {
    pub fn new(manager: Arc<ModelManager>, defaults: QueryDefaults) -> Self {
        Self { manager, defaults }
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn defaults(&self) -> &QueryDefaults {
        &self.defaults
    }

    /// Embed one text with `model` or the default text model.
    pub async fn embed_text(&self, text: &str, model: Option<&str>) -> Result<Embedding, EmbeddingError> {
        let model = model.unwrap_or(&self.defaults.text_model);
        let modality = self.text_modality(model).await?;
        self.manager
            .embed(model, &[text.to_string()], modality)
            .await?
            .into_iter()
            .next()
            .ok_or(EmbeddingError::NoInput)
    }

    /// Weight-scaled sum of per-term embeddings, normalized unless zero.
    pub async fn embed_weighted_terms(
        &self,
        weights: &WeightedInputs,
        model: Option<&str>,
    ) -> Result<Vec<f32>, EmbeddingError> {
        if weights.is_empty() {
            return Err(EmbeddingError::NoInput);
        }
        let model = model.unwrap_or(&self.defaults.text_model);
        let modality = self.text_modality(model).await?;
        let embeddings = self.manager.embed(model, &weights.keys(), modality).await?;

        let vectors: Vec<&[f32]> = embeddings.iter().map(|e| e.values.as_slice()).collect();
        let term_weights: Vec<f64> = weights.iter().map(|(_, w)| w as f64).collect();
        let mut aggregate = weighted_sum(&vectors, &term_weights)?;
        normalize_f64(&mut aggregate);
        Ok(to_f32(aggregate))
    }

    /// Embed one image URL (or base64 payload).
    ///
    /// Model choice: `model`, else the text model when images are routed to
    /// it and it is a known model, else the default image model.
    pub async fn embed_image_url(&self, url: &str, model: Option<&str>) -> Result<Embedding, EmbeddingError> {
        let chosen = match model {
            Some(m) => m,
            None if self.defaults.use_text_model_for_images
                && self.manager.catalog().contains(&self.defaults.text_model) =>
            {
                &self.defaults.text_model
            }
            None => &self.defaults.image_model,
        };
        self.manager
            .get_or_load(chosen, self.manager.get_model_type(chosen), false)
            .await?;
        self.manager
            .embed(chosen, &[url.to_string()], ModelType::Image)
            .await?
            .into_iter()
            .next()
            .ok_or(EmbeddingError::NoInput)
    }

    /// Combine every contribution of `request` into one vector.
    pub async fn build(&self, request: &QueryEmbeddingRequest) -> Result<QueryEmbedding, EmbeddingError> {
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut components: Vec<Contribution> = Vec::new();

        let text_model = request.text_model.as_deref();

        if let Some(terms) = request.term_weights.as_ref().filter(|t| !t.is_empty()) {
            let aggregate = self.embed_weighted_terms(terms, text_model).await?;
            components.push(Contribution {
                kind: ContributionKind::TermAgg,
                weight: 1.0,
                key: None,
                count: Some(terms.len()),
                sample: sample(&aggregate),
            });
            vectors.push(aggregate);
            weights.push(1.0);
        }

        if let Some(texts) = request.weighted_texts.as_ref().filter(|t| !t.is_empty()) {
            let model = text_model.unwrap_or(&self.defaults.text_model);
            let embeddings = self.manager.embed(model, &texts.keys(), ModelType::Text).await?;
            for ((text, weight), embedding) in texts.iter().zip(embeddings) {
                components.push(Contribution {
                    kind: ContributionKind::Text,
                    weight,
                    key: Some(text.chars().take(TEXT_KEY_LEN).collect()),
                    count: None,
                    sample: embedding.sample(SAMPLE_LEN),
                });
                vectors.push(embedding.values);
                weights.push(weight as f64);
            }
        }

        if let Some(images) = request.weighted_images.as_ref().filter(|i| !i.is_empty()) {
            let model = request
                .image_model
                .as_deref()
                .or(text_model)
                .unwrap_or(&self.defaults.image_model);
            let embeddings = self.manager.embed(model, &images.keys(), ModelType::Image).await?;
            for ((url, weight), embedding) in images.iter().zip(embeddings) {
                components.push(Contribution {
                    kind: ContributionKind::Image,
                    weight,
                    key: Some(url.to_string()),
                    count: None,
                    sample: embedding.sample(SAMPLE_LEN),
                });
                vectors.push(embedding.values);
                weights.push(weight as f64);
            }
        }

        if vectors.is_empty() {
            return Err(EmbeddingError::NoInput);
        }

        let strategy = request
            .strategy
            .clone()
            .unwrap_or_else(|| self.defaults.strategy.clone());
        let slices: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();
        let mut combined = combine(&slices, &weights, CombineStrategy::from_name(&strategy))?;
        if request.normalize.unwrap_or(self.defaults.normalize) {
            normalize_f64(&mut combined);
        }
        let vector = to_f32(combined);

        debug!(
            components = components.len(),
            strategy = %strategy,
            dim = vector.len(),
            "Built query embedding"
        );

        Ok(QueryEmbedding {
            dimension: vector.len(),
            vector,
            strategy,
            components,
        })
    }

    /// Load `model` with its catalog modality; return the modality its text
    /// content is embedded with.
    async fn text_modality(&self, model: &str) -> Result<ModelType, EmbeddingError> {
        let info = self
            .manager
            .get_or_load(model, self.manager.get_model_type(model), false)
            .await?;
        Ok(info.model_type)
    }
}

/// Combine equally sized vectors with per-vector weights.
///
/// `Mean` with all weights 1.0 is the plain arithmetic mean; with other
/// weights it divides the weighted sum by the weight total, which must not
/// be zero.
pub fn combine(
    vectors: &[&[f32]],
    weights: &[f64],
    strategy: CombineStrategy,
) -> Result<Vec<f64>, EmbeddingError> {
    match strategy {
        CombineStrategy::WeightedSum => weighted_sum(vectors, weights),
        CombineStrategy::Mean => {
            let uniform = weights.iter().all(|w| *w == 1.0);
            let effective: Vec<f64> = if uniform {
                vec![1.0; vectors.len()]
            } else {
                weights.to_vec()
            };
            let total: f64 = effective.iter().sum();
            if total == 0.0 {
                return Err(EmbeddingError::InvalidInput(
                    "weights sum to zero, cannot take a weighted mean".to_string(),
                ));
            }
            let mut sum = weighted_sum(vectors, &effective)?;
            sum.iter_mut().for_each(|v| *v /= total);
            Ok(sum)
        }
    }
}

fn weighted_sum(vectors: &[&[f32]], weights: &[f64]) -> Result<Vec<f64>, EmbeddingError> {
    let dim = vectors.first().map(|v| v.len()).ok_or(EmbeddingError::NoInput)?;
    let mut out = vec![0f64; dim];
    for (vector, weight) in vectors.iter().zip(weights) {
        if vector.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }
        for (acc, v) in out.iter_mut().zip(vector.iter()) {
            *acc += *v as f64 * weight;
        }
    }
    Ok(out)
}

fn normalize_f64(values: &mut [f64]) {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

fn to_f32(values: Vec<f64>) -> Vec<f32> {
    values.into_iter().map(|v| v as f32).collect()
}

fn sample(values: &[f32]) -> Vec<f32> {
    values.iter().take(SAMPLE_LEN).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_name() {
        assert_eq!(CombineStrategy::from_name("MEAN"), CombineStrategy::Mean);
        assert_eq!(CombineStrategy::from_name("WEIGHTED_SUM"), CombineStrategy::WeightedSum);
        assert_eq!(CombineStrategy::from_name("whatever"), CombineStrategy::WeightedSum);
    }

    #[test]
    fn test_mean_with_unit_weights_is_arithmetic_mean() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 3.0];
        let out = combine(&[&a, &b], &[1.0, 1.0], CombineStrategy::Mean).unwrap();
        assert_eq!(out, vec![0.5, 1.5]);
    }

    #[test]
    fn test_weighted_mean_and_sum() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let mean = combine(&[&a, &b], &[3.0, 1.0], CombineStrategy::Mean).unwrap();
        assert_eq!(mean, vec![0.75, 0.25]);

        let sum = combine(&[&a, &b], &[3.0, 1.0], CombineStrategy::WeightedSum).unwrap();
        assert_eq!(sum, vec![3.0, 1.0]);
    }

    #[test]
    fn test_mean_zero_weight_total_is_rejected() {
        let a = [1.0f32];
        let b = [2.0f32];
        assert!(matches!(
            combine(&[&a, &b], &[1.0, -1.0], CombineStrategy::Mean),
            Err(EmbeddingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = [1.0f32, 2.0];
        let b = [1.0f32];
        assert!(matches!(
            combine(&[&a, &b], &[1.0, 1.0], CombineStrategy::WeightedSum),
            Err(EmbeddingError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_weighted_inputs_mapping_semantics() {
        let inputs: WeightedInputs = [("red", 1.0), ("shoe", 2.0), ("red", 5.0)]
            .into_iter()
            .collect();
        let pairs: Vec<(&str, f32)> = inputs.iter().collect();
        assert_eq!(pairs, vec![("red", 5.0), ("shoe", 2.0)]);
    }

    #[test]
    fn test_contribution_serialization() {
        let c = Contribution {
            kind: ContributionKind::TermAgg,
            weight: 1.0,
            key: None,
            count: Some(3),
            sample: vec![0.5],
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "TERM_AGG");
        assert_eq!(json["count"], 3);
        assert!(json.get("key").is_none());
    }

    #[test]
    fn test_zero_vector_not_normalized() {
        let mut v = vec![0.0, 0.0];
        normalize_f64(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
