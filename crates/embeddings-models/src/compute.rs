//! Embedding computation over a loaded handle.
//!
//! Every path ends in unit-length vectors (zero vectors are left alone).

use candle_core::{DType, Tensor};
use image::DynamicImage;
use tracing::debug;

use embeddings_types::ModelType;

use crate::backend::{JointInputs, ModelBackend, ModelHandle};
use crate::error::EmbeddingError;
use crate::model::Embedding;
use crate::pooling::mean_pooling;

/// A batch of resolved content.
#[derive(Debug, Clone)]
pub enum ContentBatch {
    Texts(Vec<String>),
    Images(Vec<DynamicImage>),
}

impl ContentBatch {
    pub fn len(&self) -> usize {
        match self {
            ContentBatch::Texts(t) => t.len(),
            ContentBatch::Images(i) => i.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn modality(&self) -> ModelType {
        match self {
            ContentBatch::Texts(_) => ModelType::Text,
            ContentBatch::Images(_) => ModelType::Image,
        }
    }
}

/// Embed a batch with `handle`, one normalized vector per item.
///
/// Runs model forward passes synchronously; async callers go through
/// `spawn_blocking`.
pub fn embed(handle: &ModelHandle, content: &ContentBatch) -> Result<Vec<Embedding>, EmbeddingError> {
    if content.is_empty() {
        return Ok(vec![]);
    }
    let unsupported = || EmbeddingError::UnsupportedModality {
        model: handle.id.clone(),
        modality: content.modality(),
    };

    let rows: Vec<Vec<f32>> = match (&handle.backend, content) {
        (ModelBackend::DirectEncoder(encoder), ContentBatch::Texts(texts)) => {
            encoder.encode_texts(texts)?
        }
        (ModelBackend::DirectEncoder(encoder), ContentBatch::Images(images)) => {
            if !encoder.supports_images() {
                return Err(unsupported());
            }
            encoder.encode_images(images)?
        }

        (ModelBackend::TokenizerMeanPool { tokenizer, encoder }, ContentBatch::Texts(texts)) => {
            let (input_ids, attention_mask) = tokenizer.encode_batch(texts)?.to_tensors(&handle.device)?;
            let hidden = encoder.forward(&input_ids, &attention_mask)?;
            rows_of(&mean_pooling(&hidden, &attention_mask)?)?
        }
        (ModelBackend::TokenizerMeanPool { .. }, ContentBatch::Images(_)) => {
            return Err(unsupported());
        }

        (ModelBackend::DualEncoderOpen { tokenizer, towers, .. }, ContentBatch::Texts(texts)) => {
            let (input_ids, _) = tokenizer.encode_batch(texts)?.to_tensors(&handle.device)?;
            rows_of(&towers.encode_text(&input_ids)?)?
        }
        (
            ModelBackend::DualEncoderOpen {
                preprocessor,
                towers,
                ..
            },
            ContentBatch::Images(images),
        ) => {
            let pixels = preprocessor.preprocess_batch(images, &handle.device)?;
            rows_of(&towers.encode_image(&pixels)?)?
        }

        (ModelBackend::DualEncoderAuto { tokenizer, model, .. }, ContentBatch::Texts(texts)) => {
            let (input_ids, attention_mask) = tokenizer.encode_batch(texts)?.to_tensors(&handle.device)?;
            let output = model.forward(&JointInputs::Text {
                input_ids,
                attention_mask: attention_mask.clone(),
            })?;
            match (output.text_embeds, output.last_hidden_state) {
                (Some(embeds), _) => rows_of(&embeds)?,
                (None, Some(hidden)) => rows_of(&mean_pooling(&hidden, &attention_mask)?)?,
                (None, None) => {
                    return Err(EmbeddingError::MissingOutput {
                        model: handle.id.clone(),
                        field: "text_embeds",
                    })
                }
            }
        }
        // No pooled fallback for images: a joint model without image
        // projections cannot embed them.
        (
            ModelBackend::DualEncoderAuto {
                preprocessor,
                model,
                ..
            },
            ContentBatch::Images(images),
        ) => {
            let pixel_values = preprocessor.preprocess_batch(images, &handle.device)?;
            let output = model.forward(&JointInputs::Image { pixel_values })?;
            let embeds = output.image_embeds.ok_or_else(|| EmbeddingError::MissingOutput {
                model: handle.id.clone(),
                field: "image_embeds",
            })?;
            rows_of(&embeds)?
        }
    };

    if rows.len() != content.len() {
        return Err(EmbeddingError::InvalidInput(format!(
            "model {} returned {} vectors for {} inputs",
            handle.id,
            rows.len(),
            content.len()
        )));
    }

    debug!(
        model = %handle.id,
        backend = handle.backend.kind(),
        count = rows.len(),
        "Batch complete"
    );
    Ok(rows.into_iter().map(Embedding::new).collect())
}

fn rows_of(tensor: &Tensor) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    Ok(tensor.to_dtype(DType::F32)?.to_vec2()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        fake_handle, FakeJointEncoder, FakeSentenceEncoder, FakeTokenEncoder, FakeTokenizer,
        FakeTowers,
    };
    use crate::image_input::ImagePreprocessor;
    use image::{Rgb, RgbImage};

    fn texts(items: &[&str]) -> ContentBatch {
        ContentBatch::Texts(items.iter().map(|s| s.to_string()).collect())
    }

    fn one_image() -> ContentBatch {
        ContentBatch::Images(vec![DynamicImage::ImageRgb8(RgbImage::from_pixel(
            2,
            2,
            Rgb([10, 20, 30]),
        ))])
    }

    fn assert_unit(values: &[f32]) {
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm was {}", norm);
    }

    #[test]
    fn test_direct_encoder_text() {
        let handle = fake_handle(
            "modelA",
            ModelType::Text,
            ModelBackend::DirectEncoder(Box::new(FakeSentenceEncoder::new(4))),
        );
        let out = embed(&handle, &texts(&["hello"])).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dimension(), 4);
        assert_unit(&out[0].values);
    }

    #[test]
    fn test_text_only_direct_encoder_rejects_images() {
        let handle = fake_handle(
            "modelA",
            ModelType::Text,
            ModelBackend::DirectEncoder(Box::new(FakeSentenceEncoder::new(4))),
        );
        assert!(matches!(
            embed(&handle, &one_image()),
            Err(EmbeddingError::UnsupportedModality { .. })
        ));
    }

    #[test]
    fn test_mean_pool_text() {
        let handle = fake_handle(
            "pool",
            ModelType::Text,
            ModelBackend::TokenizerMeanPool {
                tokenizer: Box::new(FakeTokenizer),
                encoder: Box::new(FakeTokenEncoder::new(6)),
            },
        );
        let out = embed(&handle, &texts(&["a b c", "d"])).unwrap();
        assert_eq!(out.len(), 2);
        for e in &out {
            assert_eq!(e.dimension(), 6);
            assert_unit(&e.values);
        }
        assert!(matches!(
            embed(&handle, &one_image()),
            Err(EmbeddingError::UnsupportedModality { .. })
        ));
    }

    #[test]
    fn test_open_dual_encoder_both_modalities() {
        let handle = fake_handle(
            "dual",
            ModelType::Multimodal,
            ModelBackend::DualEncoderOpen {
                tokenizer: Box::new(FakeTokenizer),
                preprocessor: ImagePreprocessor::clip(4),
                towers: Box::new(FakeTowers::new(3)),
            },
        );
        let text = embed(&handle, &texts(&["shoe"])).unwrap();
        let image = embed(&handle, &one_image()).unwrap();
        assert_eq!(text[0].dimension(), 3);
        assert_eq!(image[0].dimension(), 3);
        assert_unit(&image[0].values);
    }

    #[test]
    fn test_joint_text_falls_back_to_hidden_state() {
        let handle = fake_handle(
            "joint",
            ModelType::Multimodal,
            ModelBackend::DualEncoderAuto {
                tokenizer: Box::new(FakeTokenizer),
                preprocessor: ImagePreprocessor::clip(4),
                model: Box::new(FakeJointEncoder::hidden_state_only(5)),
            },
        );
        let out = embed(&handle, &texts(&["x y"])).unwrap();
        assert_eq!(out[0].dimension(), 5);
        assert_unit(&out[0].values);
    }

    #[test]
    fn test_joint_image_requires_image_embeds() {
        let handle = fake_handle(
            "joint",
            ModelType::Multimodal,
            ModelBackend::DualEncoderAuto {
                tokenizer: Box::new(FakeTokenizer),
                preprocessor: ImagePreprocessor::clip(4),
                model: Box::new(FakeJointEncoder::hidden_state_only(5)),
            },
        );
        match embed(&handle, &one_image()) {
            Err(EmbeddingError::MissingOutput { field, .. }) => assert_eq!(field, "image_embeds"),
            other => panic!("expected MissingOutput, got {:?}", other.map(|v| v.len())),
        }

        let full = fake_handle(
            "joint",
            ModelType::Multimodal,
            ModelBackend::DualEncoderAuto {
                tokenizer: Box::new(FakeTokenizer),
                preprocessor: ImagePreprocessor::clip(4),
                model: Box::new(FakeJointEncoder::projected(5)),
            },
        );
        assert_eq!(embed(&full, &one_image()).unwrap()[0].dimension(), 5);
    }

    #[test]
    fn test_empty_batch() {
        let handle = fake_handle(
            "modelA",
            ModelType::Text,
            ModelBackend::DirectEncoder(Box::new(FakeSentenceEncoder::new(4))),
        );
        assert!(embed(&handle, &ContentBatch::Texts(vec![])).unwrap().is_empty());
    }
}
