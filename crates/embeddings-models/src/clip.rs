//! CLIP-architecture dual encoders.
//!
//! Three repository layouts reach the same candle `ClipModel`:
//! - sentence-transformers (`0_CLIPModel/` module dir) as a direct encoder,
//! - open_clip native towers, whose tensor names are remapped to the
//!   transformers layout (see `open_clip`),
//! - transformers with a processor config, driven as a joint model.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::text_model::ClipTextConfig;
use candle_transformers::models::clip::vision_model::ClipVisionConfig;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::DynamicImage;
use serde_json::Value;
use tracing::{debug, info};

use crate::artifacts::{read_json, ModelArtifacts};
use crate::backend::{DualTowerEncoder, JointEncoder, JointInputs, JointOutput, SentenceEncoder};
use crate::error::EmbeddingError;
use crate::image_input::ImagePreprocessor;
use crate::tokenizer::{HfTokenizer, TextTokenizer};

/// Files of a transformers CLIP repository with processor config.
pub const JOINT_FILES: &[&str] = &[
    "config.json",
    "tokenizer.json",
    "model.safetensors",
    "preprocessor_config.json",
];

/// CLIP tokenizers pad with id 0; see `HfTokenizer::with_pad_id`.
pub const CLIP_PAD_ID: u32 = 0;

impl DualTowerEncoder for ClipModel {
    fn encode_text(&self, input_ids: &Tensor) -> Result<Tensor, EmbeddingError> {
        Ok(self.get_text_features(input_ids)?)
    }

    fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor, EmbeddingError> {
        Ok(self.get_image_features(pixel_values)?)
    }
}

impl JointEncoder for ClipModel {
    fn forward(&self, inputs: &JointInputs) -> Result<JointOutput, EmbeddingError> {
        match inputs {
            JointInputs::Text { input_ids, .. } => Ok(JointOutput {
                text_embeds: Some(self.get_text_features(input_ids)?),
                ..Default::default()
            }),
            JointInputs::Image { pixel_values } => Ok(JointOutput {
                image_embeds: Some(self.get_image_features(pixel_values)?),
                ..Default::default()
            }),
        }
    }
}

/// A loaded CLIP model with the pieces needed to feed it.
pub struct ClipParts {
    pub model: ClipModel,
    pub tokenizer: HfTokenizer,
    pub preprocessor: ImagePreprocessor,
    pub projection_dim: usize,
}

/// Load a transformers CLIP repository (joint-processor strategy).
pub fn load_joint(artifacts: &ModelArtifacts, device: &Device) -> Result<ClipParts, EmbeddingError> {
    let paths = artifacts.fetch(JOINT_FILES)?;
    let config = clip_config_from_transformers(&read_json(&paths[0])?);
    let preprocessor = ImagePreprocessor::from_processor_config(&paths[3])?;
    load_transformers_layout(&config, &paths[1], &paths[2], preprocessor, device)
}

fn load_transformers_layout(
    config: &ClipConfig,
    tokenizer_path: &Path,
    weights_path: &Path,
    preprocessor: ImagePreprocessor,
    device: &Device,
) -> Result<ClipParts, EmbeddingError> {
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[weights_path.to_path_buf()], DType::F32, device)?
    };
    let model = ClipModel::new(vb, config)?;
    let tokenizer = HfTokenizer::from_file(tokenizer_path, config.text_config.max_position_embeddings)?
        .with_pad_id(CLIP_PAD_ID);

    Ok(ClipParts {
        model,
        tokenizer,
        preprocessor,
        projection_dim: config.text_config.projection_dim,
    })
}

/// Sentence-transformers CLIP: raw texts and images in, features out.
pub struct ClipSentenceEncoder {
    parts: ClipParts,
    device: Device,
}

impl ClipSentenceEncoder {
    /// Load the CLIP module found at `module_dir` ("" for the repository root).
    pub fn load(
        artifacts: &ModelArtifacts,
        module_dir: &str,
        device: &Device,
    ) -> Result<Self, EmbeddingError> {
        let file = |name: &str| {
            if module_dir.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", module_dir.trim_end_matches('/'), name)
            }
        };
        let files = [
            file("config.json"),
            file("tokenizer.json"),
            file("model.safetensors"),
        ];
        let names: Vec<&str> = files.iter().map(String::as_str).collect();
        let paths = artifacts.fetch(&names)?;

        let config = clip_config_from_transformers(&read_json(&paths[0])?);
        let preprocessor = match artifacts.fetch_optional(&file("preprocessor_config.json")) {
            Some(path) => ImagePreprocessor::from_processor_config(&path)?,
            None => ImagePreprocessor::clip(config.vision_config.image_size),
        };
        let parts = load_transformers_layout(&config, &paths[1], &paths[2], preprocessor, device)?;

        info!(
            repo = %artifacts.repo_id,
            module = module_dir,
            dim = parts.projection_dim,
            "CLIP sentence encoder loaded"
        );

        Ok(Self {
            parts,
            device: device.clone(),
        })
    }
}

impl SentenceEncoder for ClipSentenceEncoder {
    fn dimensions(&self) -> usize {
        self.parts.projection_dim
    }

    fn encode_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let batch = self.parts.tokenizer.encode_batch(texts)?;
        let (input_ids, _) = batch.to_tensors(&self.device)?;
        let features = self.parts.model.get_text_features(&input_ids)?;
        Ok(features.to_dtype(DType::F32)?.to_vec2()?)
    }

    fn supports_images(&self) -> bool {
        true
    }

    fn encode_images(&self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let pixels = self.parts.preprocessor.preprocess_batch(images, &self.device)?;
        let features = self.parts.model.get_image_features(&pixels)?;
        Ok(features.to_dtype(DType::F32)?.to_vec2()?)
    }
}

fn usize_at(value: Option<&Value>, key: &str, default: usize) -> usize {
    value
        .and_then(|v| v.get(key))
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

/// Build a candle config from a transformers `config.json`.
///
/// Absent keys fall back to the ViT-B/32 values, which is also what
/// transformers assumes when nested configs omit them.
pub fn clip_config_from_transformers(value: &Value) -> ClipConfig {
    let base = ClipConfig::vit_base_patch32();
    let text = value.get("text_config");
    let vision = value.get("vision_config");
    let projection_dim = usize_at(Some(value), "projection_dim", base.text_config.projection_dim);

    let text_config = ClipTextConfig {
        vocab_size: usize_at(text, "vocab_size", base.text_config.vocab_size),
        embed_dim: usize_at(text, "hidden_size", base.text_config.embed_dim),
        intermediate_size: usize_at(text, "intermediate_size", base.text_config.intermediate_size),
        max_position_embeddings: usize_at(
            text,
            "max_position_embeddings",
            base.text_config.max_position_embeddings,
        ),
        num_hidden_layers: usize_at(text, "num_hidden_layers", base.text_config.num_hidden_layers),
        num_attention_heads: usize_at(
            text,
            "num_attention_heads",
            base.text_config.num_attention_heads,
        ),
        projection_dim,
        ..base.text_config
    };
    let vision_config = ClipVisionConfig {
        embed_dim: usize_at(vision, "hidden_size", base.vision_config.embed_dim),
        intermediate_size: usize_at(vision, "intermediate_size", base.vision_config.intermediate_size),
        num_hidden_layers: usize_at(vision, "num_hidden_layers", base.vision_config.num_hidden_layers),
        num_attention_heads: usize_at(
            vision,
            "num_attention_heads",
            base.vision_config.num_attention_heads,
        ),
        image_size: usize_at(vision, "image_size", base.vision_config.image_size),
        patch_size: usize_at(vision, "patch_size", base.vision_config.patch_size),
        projection_dim,
        ..base.vision_config
    };

    ClipConfig {
        image_size: vision_config.image_size,
        text_config,
        vision_config,
        ..base
    }
}

/// Build a candle config from an `open_clip_config.json` with native towers.
pub fn clip_config_from_open_clip(value: &Value) -> Result<ClipConfig, EmbeddingError> {
    let model_cfg = value
        .get("model_cfg")
        .ok_or_else(|| EmbeddingError::InvalidInput("open_clip config has no model_cfg".to_string()))?;
    let vision = model_cfg.get("vision_cfg");
    let text = model_cfg.get("text_cfg");

    let base = ClipConfig::vit_base_patch32();
    let projection_dim = usize_at(Some(model_cfg), "embed_dim", base.text_config.projection_dim);

    let text_width = usize_at(text, "width", base.text_config.embed_dim);
    let text_config = ClipTextConfig {
        vocab_size: usize_at(text, "vocab_size", base.text_config.vocab_size),
        embed_dim: text_width,
        intermediate_size: text_width * 4,
        max_position_embeddings: usize_at(text, "context_length", base.text_config.max_position_embeddings),
        num_hidden_layers: usize_at(text, "layers", base.text_config.num_hidden_layers),
        num_attention_heads: usize_at(text, "heads", base.text_config.num_attention_heads),
        projection_dim,
        ..base.text_config
    };

    let vision_width = usize_at(vision, "width", base.vision_config.embed_dim);
    let head_width = usize_at(vision, "head_width", 64).max(1);
    let mlp_ratio = vision
        .and_then(|v| v.get("mlp_ratio"))
        .and_then(Value::as_f64)
        .unwrap_or(4.0);
    let vision_config = ClipVisionConfig {
        embed_dim: vision_width,
        intermediate_size: (vision_width as f64 * mlp_ratio) as usize,
        num_hidden_layers: usize_at(vision, "layers", base.vision_config.num_hidden_layers),
        num_attention_heads: vision_width / head_width,
        image_size: usize_at(vision, "image_size", base.vision_config.image_size),
        patch_size: usize_at(vision, "patch_size", base.vision_config.patch_size),
        projection_dim,
        ..base.vision_config
    };

    Ok(ClipConfig {
        image_size: vision_config.image_size,
        text_config,
        vision_config,
        ..base
    })
}

/// Target name of a non-block open_clip tensor, and whether it must be
/// transposed (open_clip stores projections as `x @ W`, transformers as
/// `Linear` weights).
fn rename_top_level(name: &str) -> Option<(String, bool)> {
    let renamed = match name {
        "token_embedding.weight" => "text_model.embeddings.token_embedding.weight".to_string(),
        "positional_embedding" => "text_model.embeddings.position_embedding.weight".to_string(),
        "text_projection" => return Some(("text_projection.weight".to_string(), true)),
        "logit_scale" => "logit_scale".to_string(),
        "visual.conv1.weight" => "vision_model.embeddings.patch_embedding.weight".to_string(),
        "visual.class_embedding" => "vision_model.embeddings.class_embedding".to_string(),
        "visual.positional_embedding" => {
            "vision_model.embeddings.position_embedding.weight".to_string()
        }
        "visual.proj" => return Some(("visual_projection.weight".to_string(), true)),
        other => {
            if let Some(p) = other.strip_prefix("ln_final.") {
                format!("text_model.final_layer_norm.{}", p)
            } else if let Some(p) = other.strip_prefix("visual.ln_pre.") {
                format!("vision_model.pre_layrnorm.{}", p)
            } else if let Some(p) = other.strip_prefix("visual.ln_post.") {
                format!("vision_model.post_layernorm.{}", p)
            } else {
                return None;
            }
        }
    };
    Some((renamed, false))
}

/// Split `transformer.resblocks.N.rest` into the target layer prefix and `rest`.
fn split_block(name: &str) -> Option<(String, &str)> {
    let (tower, rest) = if let Some(r) = name.strip_prefix("visual.transformer.resblocks.") {
        ("vision_model", r)
    } else if let Some(r) = name.strip_prefix("transformer.resblocks.") {
        ("text_model", r)
    } else {
        return None;
    };
    let (index, param) = rest.split_once('.')?;
    Some((format!("{}.encoder.layers.{}", tower, index), param))
}

fn rename_block_param(param: &str) -> Option<String> {
    let pairs = [
        ("ln_1.", "layer_norm1."),
        ("ln_2.", "layer_norm2."),
        ("attn.out_proj.", "self_attn.out_proj."),
        ("mlp.c_fc.", "mlp.fc1."),
        ("mlp.c_proj.", "mlp.fc2."),
    ];
    pairs
        .iter()
        .find_map(|(from, to)| param.strip_prefix(from).map(|rest| format!("{}{}", to, rest)))
}

/// Rename open_clip tensors to the transformers CLIP layout.
///
/// Fused attention input projections are split into separate q/k/v
/// projections. Buffers with no counterpart (e.g. `attn_mask`) are dropped.
pub fn open_clip_to_transformers(
    tensors: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>, EmbeddingError> {
    let mut out = HashMap::with_capacity(tensors.len() * 2);

    for (name, tensor) in tensors {
        if let Some((prefix, param)) = split_block(&name) {
            let fused_suffix = match param {
                "attn.in_proj_weight" => Some("weight"),
                "attn.in_proj_bias" => Some("bias"),
                _ => None,
            };
            if let Some(suffix) = fused_suffix {
                let chunks = tensor.chunk(3, 0)?;
                for (proj, chunk) in ["q_proj", "k_proj", "v_proj"].iter().zip(chunks) {
                    out.insert(
                        format!("{}.self_attn.{}.{}", prefix, proj, suffix),
                        chunk.contiguous()?,
                    );
                }
            } else if let Some(mapped) = rename_block_param(param) {
                out.insert(format!("{}.{}", prefix, mapped), tensor);
            } else {
                debug!(tensor = %name, "Skipping unmapped open_clip tensor");
            }
            continue;
        }

        match rename_top_level(&name) {
            Some((target, true)) => {
                out.insert(target, tensor.t()?.contiguous()?);
            }
            Some((target, false)) => {
                out.insert(target, tensor);
            }
            None => debug!(tensor = %name, "Skipping unmapped open_clip tensor"),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transformers_config_overrides() {
        let value = serde_json::json!({
            "projection_dim": 768,
            "text_config": {"hidden_size": 768, "num_attention_heads": 12},
            "vision_config": {"hidden_size": 1024, "patch_size": 14, "image_size": 224, "num_hidden_layers": 24}
        });
        let config = clip_config_from_transformers(&value);
        assert_eq!(config.text_config.projection_dim, 768);
        assert_eq!(config.text_config.embed_dim, 768);
        assert_eq!(config.vision_config.embed_dim, 1024);
        assert_eq!(config.vision_config.patch_size, 14);
        assert_eq!(config.vision_config.num_hidden_layers, 24);
        // Untouched keys keep the base values
        assert_eq!(config.text_config.max_position_embeddings, 77);
    }

    #[test]
    fn test_open_clip_config_mapping() {
        let value = serde_json::json!({
            "model_cfg": {
                "embed_dim": 512,
                "vision_cfg": {"image_size": 224, "layers": 12, "width": 768, "patch_size": 16},
                "text_cfg": {"context_length": 77, "vocab_size": 49408, "width": 512, "heads": 8, "layers": 12}
            }
        });
        let config = clip_config_from_open_clip(&value).unwrap();
        assert_eq!(config.vision_config.num_attention_heads, 12);
        assert_eq!(config.vision_config.intermediate_size, 3072);
        assert_eq!(config.vision_config.patch_size, 16);
        assert_eq!(config.text_config.intermediate_size, 2048);
        assert_eq!(config.text_config.projection_dim, 512);
    }

    #[test]
    fn test_open_clip_tensor_renames() {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "transformer.resblocks.0.attn.in_proj_weight".to_string(),
            Tensor::arange(0f32, 12., &dev).unwrap().reshape((6, 2)).unwrap(),
        );
        tensors.insert(
            "visual.transformer.resblocks.3.mlp.c_fc.bias".to_string(),
            Tensor::zeros(4, DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "visual.proj".to_string(),
            Tensor::zeros((3, 2), DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "attn_mask".to_string(),
            Tensor::zeros((2, 2), DType::F32, &dev).unwrap(),
        );

        let out = open_clip_to_transformers(tensors).unwrap();

        let k = &out["text_model.encoder.layers.0.self_attn.k_proj.weight"];
        assert_eq!(k.dims(), &[2, 2]);
        assert_eq!(k.to_vec2::<f32>().unwrap(), vec![vec![4.0, 5.0], vec![6.0, 7.0]]);
        assert!(out.contains_key("vision_model.encoder.layers.3.mlp.fc1.bias"));
        assert_eq!(out["visual_projection.weight"].dims(), &[2, 3]);
        assert!(!out.contains_key("attn_mask"));
        assert_eq!(out.len(), 5);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_sentence_transformers_clip() {
        let dir = tempfile::TempDir::new().unwrap();
        let artifacts = ModelArtifacts::new(dir.path(), "sentence-transformers/clip-ViT-B-32");
        let encoder = ClipSentenceEncoder::load(&artifacts, "0_CLIPModel", &Device::Cpu).unwrap();
        assert_eq!(encoder.dimensions(), 512);
        let rows = encoder.encode_texts(&["a red shoe".to_string()]).unwrap();
        assert_eq!(rows[0].len(), 512);
    }
}
