//! Fakes for model-free tests.
//!
//! Every fake is deterministic: the same input always yields the same
//! vector, and different inputs almost always differ.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use image::DynamicImage;

use embeddings_types::ModelType;

use crate::backend::{
    DualTowerEncoder, JointEncoder, JointInputs, JointOutput, ModelBackend, ModelHandle,
    SentenceEncoder, TokenEncoder,
};
use crate::catalog::CatalogEntry;
use crate::error::EmbeddingError;
use crate::loader::{probe_dimensions, ModelLoader};
use crate::mirror::StateMirror;
use crate::tokenizer::{TextTokenizer, TokenBatch};

fn seed_of(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(1469598103934665603u64, |h, b| (h ^ *b as u64).wrapping_mul(1099511628211))
}

/// Deterministic pseudo-random vector in [0.1, 1.0] per component.
pub fn seeded_vector(seed: u64, dims: usize) -> Vec<f32> {
    let mut state = seed | 1;
    (0..dims)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            0.1 + (state % 1000) as f32 / 1111.0
        })
        .collect()
}

fn image_seed(image: &DynamicImage) -> u64 {
    seed_of(image.to_rgb8().as_raw())
}

/// Direct encoder hashing its input.
#[derive(Debug, Clone)]
pub struct FakeSentenceEncoder {
    dims: usize,
    images: bool,
}

impl FakeSentenceEncoder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            images: false,
        }
    }

    /// Also accept images.
    pub fn with_images(mut self) -> Self {
        self.images = true;
        self
    }
}

impl SentenceEncoder for FakeSentenceEncoder {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn encode_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|t| seeded_vector(seed_of(t.as_bytes()), self.dims))
            .collect())
    }

    fn supports_images(&self) -> bool {
        self.images
    }

    fn encode_images(&self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(images
            .iter()
            .map(|i| seeded_vector(image_seed(i), self.dims))
            .collect())
    }
}

/// Whitespace tokenizer mapping words to small ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeTokenizer;

impl TextTokenizer for FakeTokenizer {
    fn encode_batch(&self, texts: &[String]) -> Result<TokenBatch, EmbeddingError> {
        let rows = texts
            .iter()
            .map(|text| {
                let mut ids: Vec<u32> = text
                    .split_whitespace()
                    .map(|w| (seed_of(w.as_bytes()) % 997) as u32 + 1)
                    .collect();
                if ids.is_empty() {
                    ids.push(1);
                }
                let mask = vec![1; ids.len()];
                (ids, mask)
            })
            .collect();
        Ok(TokenBatch::pad(rows, 64, 0))
    }
}

/// `(batch, seq, hidden)` states derived from token ids.
fn token_states(input_ids: &Tensor, hidden: usize) -> Result<Tensor, EmbeddingError> {
    let ids: Vec<Vec<u32>> = input_ids.to_vec2()?;
    let (batch, seq) = (ids.len(), ids.first().map(Vec::len).unwrap_or(0));
    let data: Vec<f32> = ids
        .iter()
        .flatten()
        .flat_map(|id| seeded_vector(*id as u64, hidden))
        .collect();
    Ok(Tensor::from_vec(data, (batch, seq, hidden), input_ids.device())?)
}

/// Token encoder returning id-derived hidden states.
#[derive(Debug, Clone)]
pub struct FakeTokenEncoder {
    hidden: usize,
}

impl FakeTokenEncoder {
    pub fn new(hidden: usize) -> Self {
        Self { hidden }
    }
}

impl TokenEncoder for FakeTokenEncoder {
    fn forward(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor, EmbeddingError> {
        token_states(input_ids, self.hidden)
    }
}

/// Pool token states at the first position into `(batch, dims)`.
fn first_token(states: &Tensor) -> Result<Tensor, EmbeddingError> {
    Ok(states.narrow(1, 0, 1)?.squeeze(1)?)
}

/// Rows derived from each image's pixels.
fn pixel_rows(pixel_values: &Tensor, dims: usize) -> Result<Tensor, EmbeddingError> {
    let flat: Vec<Vec<f32>> = pixel_values.flatten_from(1)?.to_vec2()?;
    let data: Vec<f32> = flat
        .iter()
        .flat_map(|row| {
            let bytes: Vec<u8> = row.iter().flat_map(|v| v.to_le_bytes()).collect();
            seeded_vector(seed_of(&bytes), dims)
        })
        .collect();
    Ok(Tensor::from_vec(data, (flat.len(), dims), pixel_values.device())?)
}

/// Dual towers with id- and pixel-derived features.
#[derive(Debug, Clone)]
pub struct FakeTowers {
    dims: usize,
}

impl FakeTowers {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl DualTowerEncoder for FakeTowers {
    fn encode_text(&self, input_ids: &Tensor) -> Result<Tensor, EmbeddingError> {
        first_token(&token_states(input_ids, self.dims)?)
    }

    fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor, EmbeddingError> {
        pixel_rows(pixel_values, self.dims)
    }
}

/// Joint model that either projects both modalities or only exposes
/// text hidden states.
#[derive(Debug, Clone)]
pub struct FakeJointEncoder {
    dims: usize,
    projected: bool,
}

impl FakeJointEncoder {
    /// Emits `text_embeds` and `image_embeds`.
    pub fn projected(dims: usize) -> Self {
        Self {
            dims,
            projected: true,
        }
    }

    /// Emits only `last_hidden_state` for text and nothing for images.
    pub fn hidden_state_only(dims: usize) -> Self {
        Self {
            dims,
            projected: false,
        }
    }
}

impl JointEncoder for FakeJointEncoder {
    fn forward(&self, inputs: &JointInputs) -> Result<JointOutput, EmbeddingError> {
        match (inputs, self.projected) {
            (JointInputs::Text { input_ids, .. }, true) => Ok(JointOutput {
                text_embeds: Some(first_token(&token_states(input_ids, self.dims)?)?),
                ..Default::default()
            }),
            (JointInputs::Text { input_ids, .. }, false) => Ok(JointOutput {
                last_hidden_state: Some(token_states(input_ids, self.dims)?),
                ..Default::default()
            }),
            (JointInputs::Image { pixel_values }, true) => Ok(JointOutput {
                image_embeds: Some(pixel_rows(pixel_values, self.dims)?),
                ..Default::default()
            }),
            (JointInputs::Image { .. }, false) => Ok(JointOutput::default()),
        }
    }
}

/// A CPU handle whose dimensions are probed from `backend`.
pub fn fake_handle(id: &str, modality: ModelType, backend: ModelBackend) -> ModelHandle {
    let mut handle = ModelHandle::new(id, modality, 0, Device::Cpu, backend);
    handle.dimensions = probe_dimensions(&handle, "probe").unwrap_or(0);
    handle
}

/// Loader producing fake direct encoders, counting invocations.
#[derive(Debug, Default)]
pub struct FakeLoader {
    default_dims: usize,
    dims: HashMap<String, usize>,
    failing: HashSet<String>,
    /// Loads of a model that succeed before every further one fails.
    fail_after: HashMap<String, usize>,
    delay: Option<Duration>,
    loads: AtomicUsize,
    per_model: Mutex<HashMap<String, usize>>,
}

impl FakeLoader {
    /// Every model gets `default_dims` unless overridden.
    pub fn new(default_dims: usize) -> Self {
        Self {
            default_dims,
            ..Default::default()
        }
    }

    pub fn with_dims(mut self, id: &str, dims: usize) -> Self {
        self.dims.insert(id.to_string(), dims);
        self
    }

    pub fn failing_on(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// Let `successes` loads of `id` through, then fail every later one.
    pub fn failing_after(mut self, id: &str, successes: usize) -> Self {
        self.fail_after.insert(id.to_string(), successes);
        self
    }

    /// Sleep this long inside every load.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Total loader invocations.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Loader invocations for one model.
    pub fn loads_of(&self, id: &str) -> usize {
        self.per_model
            .lock()
            .expect("fake loader mutex poisoned")
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn load(&self, entry: &CatalogEntry, modality: ModelType) -> Result<ModelHandle, EmbeddingError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut per_model = self.per_model.lock().expect("fake loader mutex poisoned");
            let count = per_model.entry(entry.id.clone()).or_default();
            *count += 1;
            *count
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let exhausted = self
            .fail_after
            .get(&entry.id)
            .is_some_and(|successes| attempt > *successes);
        if self.failing.contains(&entry.id) || exhausted {
            return Err(EmbeddingError::load(&entry.id, "injected failure"));
        }

        let dims = self.dims.get(&entry.id).copied().unwrap_or(self.default_dims);
        let mut encoder = FakeSentenceEncoder::new(dims);
        if entry.modality != ModelType::Text {
            encoder = encoder.with_images();
        }
        Ok(ModelHandle::new(
            &entry.id,
            modality,
            dims,
            Device::Cpu,
            ModelBackend::DirectEncoder(Box::new(encoder)),
        ))
    }
}

/// Mirror that records every call.
#[derive(Debug, Default)]
pub struct RecordingMirror {
    calls: Mutex<Vec<(String, ModelType, bool)>>,
    fail: bool,
}

impl RecordingMirror {
    /// A mirror whose writes all fail (after being recorded).
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, ModelType, bool)> {
        self.calls.lock().expect("mirror mutex poisoned").clone()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("mirror mutex poisoned").clear();
    }
}

#[async_trait]
impl StateMirror for RecordingMirror {
    async fn record_model_state(
        &self,
        name: &str,
        model_type: ModelType,
        loaded: bool,
    ) -> Result<(), EmbeddingError> {
        self.calls
            .lock()
            .expect("mirror mutex poisoned")
            .push((name.to_string(), model_type, loaded));
        if self.fail {
            return Err(EmbeddingError::Mirror("injected failure".to_string()));
        }
        Ok(())
    }
}
