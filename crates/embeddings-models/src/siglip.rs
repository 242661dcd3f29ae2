//! SigLIP dual encoders in open_clip layout.
//!
//! open_clip builds these from a timm ViT image trunk with attention-pool
//! head and its own text transformer pooled at the last position. Both
//! towers map onto candle's `siglip` text and vision models once the
//! tensors are renamed.

use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::{Activation, VarBuilder};
use candle_transformers::models::siglip::{TextConfig, TextModel, VisionConfig, VisionModel};
use serde_json::Value;
use tracing::debug;

use crate::backend::DualTowerEncoder;
use crate::error::EmbeddingError;

/// SigLIP tokenizers pad with `</s>`.
pub const SIGLIP_PAD_ID: u32 = 1;

const LAYER_NORM_EPS: f64 = 1e-6;

/// Text and image towers without the contrastive logit head.
pub struct SiglipTowers {
    text: TextModel,
    vision: VisionModel,
}

impl SiglipTowers {
    /// Build from tensors in the transformers SigLIP layout.
    pub fn new(vb: VarBuilder, config: &SiglipConfig) -> Result<Self, EmbeddingError> {
        Ok(Self {
            text: TextModel::new(&config.text, vb.pp("text_model"))?,
            vision: VisionModel::new(&config.vision, true, vb.pp("vision_model"))?,
        })
    }
}

impl DualTowerEncoder for SiglipTowers {
    fn encode_text(&self, input_ids: &Tensor) -> Result<Tensor, EmbeddingError> {
        Ok(input_ids.apply(&self.text)?)
    }

    fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor, EmbeddingError> {
        Ok(pixel_values.apply(&self.vision)?)
    }
}

/// Tower configs plus what the tokenizer needs to know.
#[derive(Debug, Clone)]
pub struct SiglipConfig {
    pub text: TextConfig,
    pub vision: VisionConfig,
    pub embed_dim: usize,
    /// Fixed token length; the text tower pools at the last position.
    pub context_length: usize,
    /// open_clip `clean="canonicalize"` text cleaning.
    pub canonicalize: bool,
}

/// Whether an open_clip `model_cfg` describes a timm SigLIP image trunk.
pub fn is_siglip(model_cfg: &Value) -> bool {
    model_cfg
        .pointer("/vision_cfg/timm_model_name")
        .and_then(Value::as_str)
        .is_some_and(|name| name.contains("siglip"))
}

/// Widths of the timm SigLIP ViT variants.
struct TimmVit {
    width: usize,
    depth: usize,
    heads: usize,
    mlp: usize,
}

fn timm_vit(name: &str) -> Result<TimmVit, EmbeddingError> {
    let vit = if name.contains("_so400m_") {
        TimmVit {
            width: 1152,
            depth: 27,
            heads: 16,
            mlp: 4304,
        }
    } else if name.contains("_large_") {
        TimmVit {
            width: 1024,
            depth: 24,
            heads: 16,
            mlp: 4096,
        }
    } else if name.contains("_base_") {
        TimmVit {
            width: 768,
            depth: 12,
            heads: 12,
            mlp: 3072,
        }
    } else {
        return Err(EmbeddingError::InvalidInput(format!(
            "unsupported timm vision tower '{}'",
            name
        )));
    };
    Ok(vit)
}

/// Numeric suffix of the `patch<N>` segment, e.g. 16 for `..._patch16_...`.
fn name_number(name: &str, prefix: &str) -> Option<usize> {
    name.split('_')
        .find_map(|part| part.strip_prefix(prefix))
        .and_then(|n| n.parse().ok())
}

fn usize_at(value: Option<&Value>, key: &str, default: usize) -> usize {
    value
        .and_then(|v| v.get(key))
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

/// Build tower configs from an open_clip `model_cfg` with a timm SigLIP trunk.
///
/// candle's towers have no projection beyond the text head and attention
/// pool, so both tower widths must equal `embed_dim`.
pub fn siglip_config_from_open_clip(model_cfg: &Value) -> Result<SiglipConfig, EmbeddingError> {
    let vision = model_cfg.get("vision_cfg");
    let text = model_cfg.get("text_cfg");

    let timm_name = vision
        .and_then(|v| v.get("timm_model_name"))
        .and_then(Value::as_str)
        .ok_or_else(|| EmbeddingError::InvalidInput("SigLIP config has no timm_model_name".to_string()))?;
    let vit = timm_vit(timm_name)?;
    let patch_size = name_number(timm_name, "patch").unwrap_or(16);
    let image_size = usize_at(
        vision,
        "image_size",
        timm_name
            .rsplit('_')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(224),
    );

    let text_width = usize_at(text, "width", 768);
    let mlp_ratio = text
        .and_then(|t| t.get("mlp_ratio"))
        .and_then(Value::as_f64)
        .unwrap_or(4.0);
    let embed_dim = usize_at(Some(model_cfg), "embed_dim", text_width);
    if text_width != embed_dim || vit.width != embed_dim {
        return Err(EmbeddingError::InvalidInput(format!(
            "SigLIP towers of width {}/{} need a projection to {}",
            text_width, vit.width, embed_dim
        )));
    }

    let context_length = usize_at(text, "context_length", 64);
    let text_config = TextConfig {
        vocab_size: usize_at(text, "vocab_size", 32000),
        hidden_size: text_width,
        intermediate_size: (text_width as f64 * mlp_ratio) as usize,
        num_hidden_layers: usize_at(text, "layers", 12),
        num_attention_heads: usize_at(text, "heads", 12),
        max_position_embeddings: context_length,
        hidden_act: Activation::Gelu,
        layer_norm_eps: LAYER_NORM_EPS,
        pad_token_id: SIGLIP_PAD_ID,
        bos_token_id: 49406,
        eos_token_id: 49407,
    };
    let vision_config = VisionConfig {
        hidden_size: vit.width,
        intermediate_size: vit.mlp,
        num_hidden_layers: vit.depth,
        num_attention_heads: vit.heads,
        num_channels: 3,
        image_size,
        patch_size,
        hidden_act: Activation::Gelu,
        layer_norm_eps: LAYER_NORM_EPS,
    };

    let canonicalize = text
        .and_then(|t| t.pointer("/tokenizer_kwargs/clean"))
        .and_then(Value::as_str)
        == Some("canonicalize");

    Ok(SiglipConfig {
        text: text_config,
        vision: vision_config,
        embed_dim,
        context_length,
        canonicalize,
    })
}

/// Parameter renames inside one transformer block, text then vision.
const TEXT_BLOCK: &[(&str, &str)] = &[
    ("ln_1.", "layer_norm1."),
    ("ln_2.", "layer_norm2."),
    ("attn.out_proj.", "self_attn.out_proj."),
    ("mlp.c_fc.", "mlp.fc1."),
    ("mlp.c_proj.", "mlp.fc2."),
];
const VISION_BLOCK: &[(&str, &str)] = &[
    ("norm1.", "layer_norm1."),
    ("norm2.", "layer_norm2."),
    ("attn.proj.", "self_attn.out_proj."),
    ("mlp.fc1.", "mlp.fc1."),
    ("mlp.fc2.", "mlp.fc2."),
];
const POOL_HEAD: &[(&str, &str)] = &[
    ("proj.", "attention.out_proj."),
    ("norm.", "layernorm."),
    ("mlp.fc1.", "mlp.fc1."),
    ("mlp.fc2.", "mlp.fc2."),
];

fn rename_with(param: &str, pairs: &[(&str, &str)]) -> Option<String> {
    pairs
        .iter()
        .find_map(|(from, to)| param.strip_prefix(from).map(|rest| format!("{}{}", to, rest)))
}

/// Split a fused `(3 * h, ...)` projection into q/k/v entries.
fn insert_qkv(
    out: &mut HashMap<String, Tensor>,
    prefix: &str,
    suffix: &str,
    tensor: &Tensor,
) -> Result<(), EmbeddingError> {
    let chunks = tensor.chunk(3, 0)?;
    for (proj, chunk) in ["q_proj", "k_proj", "v_proj"].iter().zip(chunks) {
        out.insert(
            format!("{}.self_attn.{}.{}", prefix, proj, suffix),
            chunk.contiguous()?,
        );
    }
    Ok(())
}

/// Rename open_clip SigLIP tensors to the transformers SigLIP layout.
///
/// Fused q/k/v projections are split; the attention-pool `q` and `kv`
/// projections are fused into one input projection. Tensors with no
/// counterpart (logit scale and bias, identity heads) are dropped.
pub fn open_clip_to_siglip(
    tensors: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>, EmbeddingError> {
    let mut out = HashMap::with_capacity(tensors.len() * 2);
    let mut pool_q: HashMap<String, Tensor> = HashMap::new();
    let mut pool_kv: HashMap<String, Tensor> = HashMap::new();

    for (name, tensor) in tensors {
        if let Some(rest) = name.strip_prefix("text.transformer.resblocks.") {
            let Some((index, param)) = rest.split_once('.') else {
                continue;
            };
            let prefix = format!("text_model.encoder.layers.{}", index);
            match param {
                "attn.in_proj_weight" => insert_qkv(&mut out, &prefix, "weight", &tensor)?,
                "attn.in_proj_bias" => insert_qkv(&mut out, &prefix, "bias", &tensor)?,
                _ => match rename_with(param, TEXT_BLOCK) {
                    Some(mapped) => {
                        out.insert(format!("{}.{}", prefix, mapped), tensor);
                    }
                    None => debug!(tensor = %name, "Skipping unmapped SigLIP tensor"),
                },
            }
        } else if let Some(rest) = name.strip_prefix("visual.trunk.blocks.") {
            let Some((index, param)) = rest.split_once('.') else {
                continue;
            };
            let prefix = format!("vision_model.encoder.layers.{}", index);
            match param {
                "attn.qkv.weight" => insert_qkv(&mut out, &prefix, "weight", &tensor)?,
                "attn.qkv.bias" => insert_qkv(&mut out, &prefix, "bias", &tensor)?,
                _ => match rename_with(param, VISION_BLOCK) {
                    Some(mapped) => {
                        out.insert(format!("{}.{}", prefix, mapped), tensor);
                    }
                    None => debug!(tensor = %name, "Skipping unmapped SigLIP tensor"),
                },
            }
        } else if let Some(param) = name.strip_prefix("visual.trunk.attn_pool.") {
            if let Some(suffix) = param.strip_prefix("q.") {
                pool_q.insert(suffix.to_string(), tensor);
            } else if let Some(suffix) = param.strip_prefix("kv.") {
                pool_kv.insert(suffix.to_string(), tensor);
            } else if param == "latent" {
                out.insert("vision_model.head.probe".to_string(), tensor);
            } else if let Some(mapped) = rename_with(param, POOL_HEAD) {
                out.insert(format!("vision_model.head.{}", mapped), tensor);
            } else {
                debug!(tensor = %name, "Skipping unmapped SigLIP tensor");
            }
        } else {
            match name.as_str() {
                "text.token_embedding.weight" => {
                    out.insert("text_model.embeddings.token_embedding.weight".to_string(), tensor);
                }
                "text.positional_embedding" => {
                    out.insert("text_model.embeddings.position_embedding.weight".to_string(), tensor);
                }
                "text.text_projection.weight" | "text.text_projection.bias" => {
                    let suffix = name.rsplit('.').next().unwrap_or_default();
                    out.insert(format!("text_model.head.{}", suffix), tensor);
                }
                // Bias-free projection stored as `x @ W`
                "text.text_projection" => {
                    let bias = Tensor::zeros(tensor.dim(1)?, tensor.dtype(), tensor.device())?;
                    out.insert("text_model.head.weight".to_string(), tensor.t()?.contiguous()?);
                    out.insert("text_model.head.bias".to_string(), bias);
                }
                "visual.trunk.pos_embed" => {
                    out.insert(
                        "vision_model.embeddings.position_embedding.weight".to_string(),
                        tensor.squeeze(0)?,
                    );
                }
                other => {
                    if let Some(p) = other.strip_prefix("text.ln_final.") {
                        out.insert(format!("text_model.final_layer_norm.{}", p), tensor);
                    } else if let Some(p) = other.strip_prefix("visual.trunk.patch_embed.proj.") {
                        out.insert(format!("vision_model.embeddings.patch_embedding.{}", p), tensor);
                    } else if let Some(p) = other.strip_prefix("visual.trunk.norm.") {
                        out.insert(format!("vision_model.post_layernorm.{}", p), tensor);
                    } else {
                        debug!(tensor = %name, "Skipping unmapped SigLIP tensor");
                    }
                }
            }
        }
    }

    for (suffix, q) in pool_q {
        let kv = pool_kv.remove(&suffix).ok_or_else(|| {
            EmbeddingError::InvalidInput(format!("attention pool has q.{} without kv.{}", suffix, suffix))
        })?;
        out.insert(
            format!("vision_model.head.attention.in_proj_{}", suffix),
            Tensor::cat(&[&q, &kv], 0)?,
        );
    }

    Ok(out)
}
