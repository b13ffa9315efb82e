//! HuggingFace model configuration (`config.json`)
//!
//! Only the fields the engine consumes are modelled; everything else in the
//! file is ignored.

#![allow(clippy::doc_markdown)]

use serde::Deserialize;
use std::path::Path;

use crate::Result;

/// Architecture and quantization metadata parsed from `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size
    pub vocab_size: usize,

    /// Hidden dimension size
    pub hidden_size: usize,

    /// Intermediate size for MLP (FFN)
    pub intermediate_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA, defaults to `num_attention_heads`)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Explicit head dimension. Qwen3-style configs declare it independently
    /// of `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,

    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,

    /// Rotary position embedding base frequency
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,

    /// Fraction of the head dimension that is rotated
    #[serde(default)]
    pub partial_rotary_factor: Option<f32>,

    /// Maximum sequence length the model was trained for
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// Pre-extension context length (longrope configs put it at top level)
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,

    /// Raw `rope_scaling` block; see [`crate::rope::RopeScaling`]
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,

    /// Tie word embeddings with `lm_head`
    #[serde(default)]
    pub tie_word_embeddings: bool,

    /// Checkpoint dtype, e.g. `"bfloat16"`
    #[serde(default)]
    pub torch_dtype: Option<String>,

    /// GPTQ quantization metadata
    #[serde(default)]
    pub quantization_config: Option<QuantizationConfig>,

    /// MiniCPM embedding multiplier
    #[serde(default)]
    pub scale_emb: Option<f32>,

    /// MiniCPM width used to derive the lm-head scale
    #[serde(default)]
    pub dim_model_base: Option<f32>,

    /// MiniCPM depth multiplier used to derive the residual scale
    #[serde(default)]
    pub scale_depth: Option<f32>,

    /// End of sequence token ID(s)
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
}

/// GPTQ quantization block of `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationConfig {
    /// Columns sharing one scale; `-1` means per-channel.
    #[serde(default)]
    pub group_size: Option<i32>,

    /// Bits per packed weight
    #[serde(default)]
    pub bits: Option<u32>,

    /// `"gptq"`, `"marlin"`, ...
    #[serde(default)]
    pub quant_method: Option<String>,

    /// Activation-order flag
    #[serde(default)]
    pub desc_act: Option<bool>,
}

/// Raw `rope_scaling` block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RopeScalingConfig {
    #[serde(default)]
    pub rope_type: Option<String>,
    /// Legacy spelling of `rope_type`
    #[serde(default, rename = "type")]
    pub legacy_type: Option<String>,
    #[serde(default)]
    pub factor: Option<f32>,
    #[serde(default)]
    pub low_freq_factor: Option<f32>,
    #[serde(default)]
    pub high_freq_factor: Option<f32>,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub short_factor: Option<Vec<f32>>,
    #[serde(default)]
    pub long_factor: Option<Vec<f32>>,
}

impl RopeScalingConfig {
    /// The scaling tag, preferring `rope_type` over the legacy `type` key.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.rope_type.as_deref().or(self.legacy_type.as_deref())
    }
}

/// A single token id or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(i32),
    Multiple(Vec<i32>),
}

impl TokenIds {
    #[must_use]
    pub fn to_vec(&self) -> Vec<i32> {
        match self {
            Self::Single(id) => vec![*id],
            Self::Multiple(ids) => ids.clone(),
        }
    }
}

fn default_rms_norm_eps() -> f32 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl ModelConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load `config.json` from a model directory
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Self::from_file(dir.as_ref().join("config.json"))
    }

    /// Get the number of key-value heads (for grouped-query attention)
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Terminator ids declared by the model, if any.
    #[must_use]
    pub fn eos_token_ids(&self) -> Vec<i32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let json = r#"{
            "vocab_size": 32000,
            "hidden_size": 2048,
            "intermediate_size": 5632,
            "num_hidden_layers": 22,
            "num_attention_heads": 32
        }"#;

        let config: ModelConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.num_kv_heads(), 32);
        assert!(config.head_dim.is_none());
        assert!(config.quantization_config.is_none());
        assert!(!config.tie_word_embeddings);
        assert!(config.eos_token_ids().is_empty());
    }

    #[test]
    fn test_minicpm_style_config() {
        let json = r#"{
            "vocab_size": 73448,
            "hidden_size": 2048,
            "intermediate_size": 6144,
            "num_hidden_layers": 52,
            "num_attention_heads": 16,
            "num_key_value_heads": 2,
            "scale_emb": 12,
            "dim_model_base": 256,
            "scale_depth": 1.4,
            "torch_dtype": "bfloat16",
            "eos_token_id": [2, 73440],
            "quantization_config": {"bits": 4, "group_size": 128, "quant_method": "gptq", "desc_act": false},
            "rope_scaling": {"rope_type": "longrope", "short_factor": [1.0], "long_factor": [2.0], "original_max_position_embeddings": 32768}
        }"#;

        let config: ModelConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.num_kv_heads(), 2);
        assert_eq!(config.scale_emb, Some(12.0));
        assert_eq!(
            config.quantization_config.as_ref().unwrap().group_size,
            Some(128)
        );
        assert_eq!(config.rope_scaling.as_ref().unwrap().kind(), Some("longrope"));
        assert_eq!(config.eos_token_ids(), vec![2, 73440]);
    }

    #[test]
    fn test_legacy_rope_type_key() {
        let json = r#"{"type": "linear", "factor": 2.0}"#;
        let scaling: RopeScalingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(scaling.kind(), Some("linear"));
    }
}
