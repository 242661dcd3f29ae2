//! Loaded model handles and the computation traits behind them.
//!
//! A handle wraps exactly one of four backend shapes. The shape is fixed by
//! the loader from the catalog entry's strategy; the embedding computer
//! dispatches on it with an exhaustive match.

use candle_core::{Device, Tensor};
use image::DynamicImage;

use embeddings_types::ModelType;

use crate::error::EmbeddingError;
use crate::image_input::ImagePreprocessor;
use crate::tokenizer::TextTokenizer;

/// An encoder that takes raw content and owns its own preprocessing.
///
/// Returned rows need not be normalized; the computer normalizes them.
pub trait SentenceEncoder: Send + Sync {
    /// Output width.
    fn dimensions(&self) -> usize;

    fn encode_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Whether `encode_images` is implemented.
    fn supports_images(&self) -> bool {
        false
    }

    fn encode_images(&self, _images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::InvalidInput(
            "encoder has no image tower".to_string(),
        ))
    }
}

/// A plain transformer encoder producing per-token hidden states.
pub trait TokenEncoder: Send + Sync {
    /// `(batch, seq)` ids and mask to `(batch, seq, hidden)` states.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor, EmbeddingError>;
}

/// Separate text and image towers projecting into one space.
pub trait DualTowerEncoder: Send + Sync {
    /// `(batch, seq)` ids to `(batch, dims)` features.
    fn encode_text(&self, input_ids: &Tensor) -> Result<Tensor, EmbeddingError>;

    /// `(batch, 3, h, w)` pixels to `(batch, dims)` features.
    fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor, EmbeddingError>;
}

/// Inputs to a joint model forward pass.
#[derive(Debug)]
pub enum JointInputs {
    Text {
        input_ids: Tensor,
        attention_mask: Tensor,
    },
    Image {
        pixel_values: Tensor,
    },
}

/// Outputs of a joint model forward pass. Which fields are set depends on
/// the model and the inputs.
#[derive(Debug, Default)]
pub struct JointOutput {
    pub text_embeds: Option<Tensor>,
    pub image_embeds: Option<Tensor>,
    pub last_hidden_state: Option<Tensor>,
}

/// A single model taking either modality through one forward entry point.
pub trait JointEncoder: Send + Sync {
    fn forward(&self, inputs: &JointInputs) -> Result<JointOutput, EmbeddingError>;
}

/// The computation object of a loaded model plus its auxiliaries.
pub enum ModelBackend {
    /// Sentence encoder with native batch encoding.
    DirectEncoder(Box<dyn SentenceEncoder>),
    /// Generic encoder whose token states are mean-pooled.
    TokenizerMeanPool {
        tokenizer: Box<dyn TextTokenizer>,
        encoder: Box<dyn TokenEncoder>,
    },
    /// Open-clip style dual encoder.
    DualEncoderOpen {
        tokenizer: Box<dyn TextTokenizer>,
        preprocessor: ImagePreprocessor,
        towers: Box<dyn DualTowerEncoder>,
    },
    /// Joint auto-model driven through a processor.
    DualEncoderAuto {
        tokenizer: Box<dyn TextTokenizer>,
        preprocessor: ImagePreprocessor,
        model: Box<dyn JointEncoder>,
    },
}

impl ModelBackend {
    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelBackend::DirectEncoder(_) => "direct",
            ModelBackend::TokenizerMeanPool { .. } => "mean_pool",
            ModelBackend::DualEncoderOpen { .. } => "open_clip",
            ModelBackend::DualEncoderAuto { .. } => "joint",
        }
    }
}

impl std::fmt::Debug for ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModelBackend").field(&self.kind()).finish()
    }
}

/// A resident model.
///
/// Owned by the manager; callers hold a shared reference for the duration
/// of one embedding call. Dropping the last reference releases its tensors.
#[derive(Debug)]
pub struct ModelHandle {
    pub id: String,
    pub modality: ModelType,
    /// Output width, probed at load time when possible.
    pub dimensions: usize,
    pub device: Device,
    pub backend: ModelBackend,
}

impl ModelHandle {
    pub fn new(
        id: impl Into<String>,
        modality: ModelType,
        dimensions: usize,
        device: Device,
        backend: ModelBackend,
    ) -> Self {
        Self {
            id: id.into(),
            modality,
            dimensions,
            device,
            backend,
        }
    }
}
