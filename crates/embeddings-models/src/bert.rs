//! BERT-family text encoders.
//!
//! `BertSentenceEncoder` reads a sentence-transformers repository (encoder
//! plus pooling config). `BertTokenEncoder` is the bare encoder used by the
//! tokenizer + mean-pool fallback.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tracing::{debug, info};

use crate::artifacts::{read_json, ModelArtifacts, ENCODER_FILES};
use crate::backend::{SentenceEncoder, TokenEncoder};
use crate::error::EmbeddingError;
use crate::pooling::{cls_pooling, mean_pooling};
use crate::tokenizer::{HfTokenizer, TextTokenizer};

/// Maximum sequence length when the repository does not declare one
pub const MAX_SEQ_LENGTH: usize = 256;

const POOLING_CONFIG: &str = "1_Pooling/config.json";
const SENTENCE_BERT_CONFIG: &str = "sentence_bert_config.json";

/// Bare BERT encoder returning per-token hidden states.
pub struct BertTokenEncoder {
    model: BertModel,
    hidden_size: usize,
}

impl BertTokenEncoder {
    /// Load from explicit file paths
    pub fn load_from_paths(
        config_path: &Path,
        weights_path: &Path,
        device: &Device,
    ) -> Result<Self, EmbeddingError> {
        let config_str = std::fs::read_to_string(config_path)?;
        let raw: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| EmbeddingError::InvalidInput(format!("Invalid config: {}", e)))?;
        let model_type = raw.get("model_type").and_then(|v| v.as_str()).unwrap_or("bert");
        if model_type != "bert" {
            return Err(EmbeddingError::InvalidInput(format!(
                "unsupported encoder architecture '{}'",
                model_type
            )));
        }
        let config: BertConfig = serde_json::from_value(raw.clone())
            .map_err(|e| EmbeddingError::InvalidInput(format!("Invalid config: {}", e)))?;
        let hidden_size = raw
            .get("hidden_size")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .ok_or_else(|| EmbeddingError::InvalidInput("config has no hidden_size".to_string()))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path.to_path_buf()], DType::F32, device)?
        };
        let model = BertModel::load(vb, &config)?;

        Ok(Self { model, hidden_size })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

impl TokenEncoder for BertTokenEncoder {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor, EmbeddingError> {
        let token_type_ids = Tensor::zeros_like(input_ids)?;
        Ok(self
            .model
            .forward(input_ids, &token_type_ids, Some(attention_mask))?)
    }
}

/// Pooling mode declared by a sentence-transformers repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    Mean,
    Cls,
}

impl Pooling {
    /// Parse `1_Pooling/config.json`. Anything but CLS pools by mean.
    pub fn from_config(value: &serde_json::Value) -> Self {
        let cls = value
            .get("pooling_mode_cls_token")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if cls {
            Pooling::Cls
        } else {
            Pooling::Mean
        }
    }
}

/// Sentence-transformers BERT model.
pub struct BertSentenceEncoder {
    encoder: BertTokenEncoder,
    tokenizer: HfTokenizer,
    pooling: Pooling,
    device: Device,
}

impl BertSentenceEncoder {
    /// Load a sentence-transformers repository (downloading if needed).
    pub fn load(artifacts: &ModelArtifacts, device: &Device) -> Result<Self, EmbeddingError> {
        let paths = artifacts.fetch(ENCODER_FILES)?;
        let (config, tokenizer, weights) = (&paths[0], &paths[1], &paths[2]);

        let pooling = match artifacts.fetch_optional(POOLING_CONFIG) {
            Some(path) => Pooling::from_config(&read_json(&path)?),
            None => Pooling::Mean,
        };
        let max_len = artifacts
            .fetch_optional(SENTENCE_BERT_CONFIG)
            .map(|path| read_json(&path))
            .transpose()?
            .and_then(|v| v.get("max_seq_length").and_then(|m| m.as_u64()))
            .map(|m| m as usize)
            .unwrap_or(MAX_SEQ_LENGTH);

        let encoder = BertTokenEncoder::load_from_paths(config, weights, device)?;
        let tokenizer = HfTokenizer::from_file(tokenizer, max_len)?;

        info!(
            repo = %artifacts.repo_id,
            dim = encoder.hidden_size(),
            max_seq = max_len,
            pooling = ?pooling,
            "Sentence encoder loaded"
        );

        Ok(Self {
            encoder,
            tokenizer,
            pooling,
            device: device.clone(),
        })
    }
}

impl SentenceEncoder for BertSentenceEncoder {
    fn dimensions(&self) -> usize {
        self.encoder.hidden_size()
    }

    fn encode_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        debug!(count = texts.len(), "Embedding batch");

        let batch = self.tokenizer.encode_batch(texts)?;
        let (input_ids, attention_mask) = batch.to_tensors(&self.device)?;
        let output = self.encoder.forward(&input_ids, &attention_mask)?;

        let pooled = match self.pooling {
            Pooling::Mean => mean_pooling(&output, &attention_mask)?,
            Pooling::Cls => cls_pooling(&output)?,
        };
        Ok(pooled.to_vec2()?)
    }
}
