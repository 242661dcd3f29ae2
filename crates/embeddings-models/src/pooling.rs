//! Token-state pooling.

use candle_core::{DType, Tensor};

use crate::error::EmbeddingError;

/// Mean pooling over token embeddings (excluding padding).
///
/// `embeddings` is `(batch, seq, hidden)`, `attention_mask` is `(batch, seq)`
/// with any integer or float dtype.
pub fn mean_pooling(embeddings: &Tensor, attention_mask: &Tensor) -> Result<Tensor, EmbeddingError> {
    let embeddings = embeddings.to_dtype(DType::F32)?;

    // Expand attention mask to embedding dimension
    let mask_f32 = attention_mask
        .to_dtype(DType::F32)?
        .unsqueeze(2)?
        .broadcast_as(embeddings.shape())?;

    // Masked sum
    let masked = embeddings.broadcast_mul(&mask_f32)?;
    let sum = masked.sum(1)?;

    // Divide by sum of mask (number of real tokens)
    let mask_sum = mask_f32.sum(1)?;
    let mask_sum = mask_sum.clamp(1e-9, f64::MAX)?;

    Ok(sum.broadcast_div(&mask_sum)?)
}

/// First-token pooling.
pub fn cls_pooling(embeddings: &Tensor) -> Result<Tensor, EmbeddingError> {
    Ok(embeddings.to_dtype(DType::F32)?.narrow(1, 0, 1)?.squeeze(1)?)
}
