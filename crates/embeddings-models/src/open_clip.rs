//! open_clip repositories (`open_clip_config.json` + `open_clip_model.safetensors`).
//!
//! The config decides the architecture: native open_clip transformer
//! towers load as candle CLIP, timm SigLIP trunks as candle SigLIP. Both
//! have their tensors renamed to the transformers layout first.

use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::ClipModel;
use serde_json::Value;
use tracing::info;

use crate::artifacts::{read_json, ModelArtifacts};
use crate::backend::DualTowerEncoder;
use crate::clip::{clip_config_from_open_clip, open_clip_to_transformers, CLIP_PAD_ID};
use crate::error::EmbeddingError;
use crate::image_input::ImagePreprocessor;
use crate::siglip::{self, SiglipTowers, SIGLIP_PAD_ID};
use crate::tokenizer::HfTokenizer;

/// Files every open_clip repository has.
pub const OPEN_CLIP_FILES: &[&str] = &["open_clip_config.json", "open_clip_model.safetensors"];

const TOKENIZER_FILE: &str = "tokenizer.json";

/// Tower architecture named by an open_clip `model_cfg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenClipArch {
    Clip,
    Siglip,
}

/// Classify a `model_cfg`, rejecting towers candle has no model for.
pub fn detect_arch(model_cfg: &Value) -> Result<OpenClipArch, EmbeddingError> {
    if siglip::is_siglip(model_cfg) {
        return Ok(OpenClipArch::Siglip);
    }
    if let Some(timm) = model_cfg
        .pointer("/vision_cfg/timm_model_name")
        .and_then(Value::as_str)
    {
        return Err(EmbeddingError::InvalidInput(format!(
            "unsupported timm vision tower '{}'",
            timm
        )));
    }
    if let Some(hf) = model_cfg
        .pointer("/text_cfg/hf_model_name")
        .and_then(Value::as_str)
    {
        return Err(EmbeddingError::InvalidInput(format!(
            "unsupported HF text tower '{}'",
            hf
        )));
    }
    Ok(OpenClipArch::Clip)
}

/// A loaded open_clip model with the pieces needed to feed it.
pub struct DualTowerParts {
    pub towers: Box<dyn DualTowerEncoder>,
    pub tokenizer: HfTokenizer,
    pub preprocessor: ImagePreprocessor,
    pub projection_dim: usize,
}

/// Locate `tokenizer.json`.
///
/// A `text_cfg.hf_tokenizer_name` wins, as it does in open_clip itself;
/// otherwise the model repository must ship its own.
pub fn resolve_tokenizer(
    artifacts: &ModelArtifacts,
    model_cfg: &Value,
) -> Result<PathBuf, EmbeddingError> {
    let named = model_cfg
        .pointer("/text_cfg/hf_tokenizer_name")
        .and_then(Value::as_str);
    match named {
        Some(name) => {
            let tokenizer_repo =
                ModelArtifacts::new(artifacts.cache_dir.clone(), name).with_token(artifacts.token.clone());
            match tokenizer_repo.fetch_optional(TOKENIZER_FILE) {
                Some(path) => Ok(path),
                None => Ok(artifacts.fetch(&[TOKENIZER_FILE])?.remove(0)),
            }
        }
        None => Ok(artifacts.fetch(&[TOKENIZER_FILE])?.remove(0)),
    }
}

/// Load an open_clip repository.
pub fn load_open_clip(
    artifacts: &ModelArtifacts,
    device: &Device,
) -> Result<DualTowerParts, EmbeddingError> {
    let paths = artifacts.fetch(OPEN_CLIP_FILES)?;
    let config = read_json(&paths[0])?;
    let model_cfg = config
        .get("model_cfg")
        .ok_or_else(|| EmbeddingError::InvalidInput("open_clip config has no model_cfg".to_string()))?;
    let arch = detect_arch(model_cfg)?;
    let preprocessor = ImagePreprocessor::from_open_clip_config(&paths[0])?;
    let tokenizer_path = resolve_tokenizer(artifacts, model_cfg)?;
    let tensors = candle_core::safetensors::load(&paths[1], device)?;

    let parts = match arch {
        OpenClipArch::Clip => {
            let config = clip_config_from_open_clip(&config)?;
            let vb = VarBuilder::from_tensors(open_clip_to_transformers(tensors)?, DType::F32, device);
            let model = ClipModel::new(vb, &config)?;
            let tokenizer =
                HfTokenizer::from_file(&tokenizer_path, config.text_config.max_position_embeddings)?
                    .with_pad_id(CLIP_PAD_ID);
            DualTowerParts {
                towers: Box::new(model),
                tokenizer,
                preprocessor,
                projection_dim: config.text_config.projection_dim,
            }
        }
        OpenClipArch::Siglip => {
            let config = siglip::siglip_config_from_open_clip(model_cfg)?;
            let vb = VarBuilder::from_tensors(siglip::open_clip_to_siglip(tensors)?, DType::F32, device);
            let towers = SiglipTowers::new(vb, &config)?;
            let mut tokenizer = HfTokenizer::from_file(&tokenizer_path, config.context_length)?
                .with_pad_id(SIGLIP_PAD_ID)
                .with_fixed_length();
            if config.canonicalize {
                tokenizer = tokenizer.with_canonicalize();
            }
            DualTowerParts {
                towers: Box::new(towers),
                tokenizer,
                preprocessor,
                projection_dim: config.embed_dim,
            }
        }
    };

    info!(
        repo = %artifacts.repo_id,
        arch = ?arch,
        dim = parts.projection_dim,
        image_size = parts.preprocessor.size,
        "open_clip model loaded"
    );

    Ok(parts)
}
