//! Text tokenization with padding and truncation.

use std::path::Path;

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::error::EmbeddingError;

/// Padded token ids and attention masks for one batch.
///
/// Every row has the same length; padding positions carry mask 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl TokenBatch {
    /// Pad (or truncate) raw id/mask rows to a common length.
    pub fn pad(rows: Vec<(Vec<u32>, Vec<u32>)>, max_len: usize, pad_id: u32) -> Self {
        let seq_len = rows
            .iter()
            .map(|(ids, _)| ids.len())
            .max()
            .unwrap_or(0)
            .min(max_len);
        Self::pad_to(rows, seq_len, pad_id)
    }

    /// Pad (or truncate) every row to exactly `seq_len`.
    pub fn pad_to(rows: Vec<(Vec<u32>, Vec<u32>)>, seq_len: usize, pad_id: u32) -> Self {
        let mut input_ids = Vec::with_capacity(rows.len());
        let mut attention_mask = Vec::with_capacity(rows.len());
        for (ids, mask) in rows {
            let truncated_len = ids.len().min(seq_len);
            let mut padded_ids = ids[..truncated_len].to_vec();
            let mut padded_mask = mask[..truncated_len].to_vec();
            padded_ids.resize(seq_len, pad_id);
            padded_mask.resize(seq_len, 0);
            input_ids.push(padded_ids);
            attention_mask.push(padded_mask);
        }

        Self {
            input_ids,
            attention_mask,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map(Vec::len).unwrap_or(0)
    }

    /// `(input_ids, attention_mask)` as `(batch, seq)` u32 tensors.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor), EmbeddingError> {
        let shape = (self.batch_size(), self.seq_len());
        let ids: Vec<u32> = self.input_ids.iter().flatten().copied().collect();
        let mask: Vec<u32> = self.attention_mask.iter().flatten().copied().collect();
        Ok((
            Tensor::from_vec(ids, shape, device)?,
            Tensor::from_vec(mask, shape, device)?,
        ))
    }
}

/// Turns a batch of texts into padded token ids.
pub trait TextTokenizer: Send + Sync {
    fn encode_batch(&self, texts: &[String]) -> Result<TokenBatch, EmbeddingError>;
}

/// HuggingFace `tokenizers` implementation.
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    max_len: usize,
    pad_id: u32,
    fixed_len: bool,
    canonicalize: bool,
}

impl HfTokenizer {
    /// Load `tokenizer.json`, truncating sequences to `max_len` tokens.
    pub fn from_file(path: &Path, max_len: usize) -> Result<Self, EmbeddingError> {
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
        let pad_id = tokenizer.get_padding().map(|p| p.pad_id).unwrap_or(0);
        Ok(Self {
            tokenizer,
            max_len,
            pad_id,
            fixed_len: false,
            canonicalize: false,
        })
    }

    /// Override the padding id.
    ///
    /// CLIP text towers pool at the highest token id, so their padding must
    /// sort below the end-of-text token.
    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }

    /// Always pad to `max_len`, for towers that pool at the last position.
    pub fn with_fixed_length(mut self) -> Self {
        self.fixed_len = true;
        self
    }

    /// Lowercase, strip punctuation and collapse whitespace before encoding.
    pub fn with_canonicalize(mut self) -> Self {
        self.canonicalize = true;
        self
    }
}

/// open_clip's `canonicalize` text cleaning.
pub fn canonicalize_text(text: &str) -> String {
    let stripped: String = text
        .replace('_', " ")
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .to_lowercase();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl TextTokenizer for HfTokenizer {
    fn encode_batch(&self, texts: &[String]) -> Result<TokenBatch, EmbeddingError> {
        let inputs: Vec<String> = if self.canonicalize {
            texts.iter().map(|t| canonicalize_text(t)).collect()
        } else {
            texts.to_vec()
        };
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        let rows = encodings
            .iter()
            .map(|e| (e.get_ids().to_vec(), e.get_attention_mask().to_vec()))
            .collect();
        if self.fixed_len {
            Ok(TokenBatch::pad_to(rows, self.max_len, self.pad_id))
        } else {
            Ok(TokenBatch::pad(rows, self.max_len, self.pad_id))
        }
    }
}
