//! Model geometry resolution.
//!
//! Turns `config.json` metadata plus caller options into the fixed set of
//! scalars the compute engine needs to lay out device state. No device
//! interaction happens here.

#![allow(clippy::cast_precision_loss, clippy::doc_markdown)]

use serde::Deserialize;

use crate::config::ModelConfig;
use crate::dtype::DType;
use crate::{Error, Result};

/// Rows in the shared logits buffer (largest micro-batch a decode call may submit).
pub const MAX_LOGIT_ROWS: usize = 64;

/// Sparse-attention tuning knobs (MiniCPM4 InfLLM-v2 style).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SparseAttentionOptions {
    /// Leading blocks always attended to
    pub sink_window_size: usize,
    /// Trailing local blocks always attended to
    pub block_window_size: usize,
    /// Blocks selected by top-k scoring
    pub topk: usize,
    /// Sequence length above which the sparse kernel takes over
    pub switch_threshold: usize,
    /// Use compressed log-sum-exp for block scoring
    pub use_compress_lse: bool,
}

impl Default for SparseAttentionOptions {
    fn default() -> Self {
        Self {
            sink_window_size: 1,
            block_window_size: 32,
            topk: 32,
            switch_threshold: 8192,
            use_compress_lse: false,
        }
    }
}

/// Which attention stack the compute engine is initialised with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttentionVariant {
    /// Dense attention, optionally with per-head QK norm and QKV bias.
    Dense { qk_norm: bool, attn_bias: bool },
    /// Block-sparse attention.
    Sparse(SparseAttentionOptions),
}

/// Caller-side engine options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Fraction of device memory the engine may claim.
    pub memory_limit: f32,
    /// Maximum tokens per prefill device call.
    pub chunk_length: usize,
    /// Activation dtype override; `None` uses `config.torch_dtype`.
    pub dtype: Option<DType>,
    /// Replay a captured fixed-shape graph for decode steps.
    pub cuda_graph: bool,
    /// Enable sparse attention with these parameters.
    pub sparse: Option<SparseAttentionOptions>,
    pub use_qk_norm: bool,
    pub use_attn_bias: bool,
    /// 0 selects greedy decoding.
    pub temperature: f32,
    /// Seed for stochastic sampling; `None` draws from OS entropy.
    pub random_seed: Option<u64>,
    /// Hand fused `qkv_proj` / `gate_up_proj` tensors to the engine as
    /// separate q/k/v and gate/up tensors.
    pub split_fused_projections: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            memory_limit: 0.8,
            chunk_length: 1024,
            dtype: None,
            cuda_graph: false,
            sparse: None,
            use_qk_norm: false,
            use_attn_bias: false,
            temperature: 0.0,
            random_seed: None,
            split_fused_projections: false,
        }
    }
}

/// Immutable device-side model geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelGeometry {
    pub vocab_size: usize,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f32,
    /// Quantization group size (`-1` = per-channel)
    pub group_size: i32,
    /// Activation dtype (f16 or bf16)
    pub dtype: DType,
    pub chunk_length: usize,
    pub embed_scale: f32,
    pub lm_head_scale: f32,
    pub residual_scale: f32,
    pub attention: AttentionVariant,
    /// Rows in the shared logits buffer
    pub max_logit_rows: usize,
}

impl ModelGeometry {
    /// Derive the engine geometry from model metadata and engine options.
    ///
    /// # Errors
    /// Returns `Configuration` when the dtype is not f16/bf16, when
    /// quantization metadata is absent, or when the head layout is
    /// inconsistent.
    pub fn resolve(config: &ModelConfig, options: &EngineOptions) -> Result<Self> {
        let dtype = match options.dtype {
            Some(dtype) => dtype,
            None => {
                let name = config.torch_dtype.as_deref().ok_or_else(|| {
                    Error::Configuration("no dtype given and config has no torch_dtype".into())
                })?;
                DType::from_torch_name(name)
                    .ok_or_else(|| Error::Configuration(format!("Unsupported dtype: {name}")))?
            }
        };
        // Validates f16/bf16 only.
        dtype.engine_code()?;

        let group_size = config
            .quantization_config
            .as_ref()
            .and_then(|q| q.group_size)
            .ok_or_else(|| {
                Error::Configuration("quantization_config.group_size is missing".into())
            })?;

        if config.num_attention_heads == 0 || config.num_hidden_layers == 0 {
            return Err(Error::Configuration(
                "num_attention_heads and num_hidden_layers must be non-zero".into(),
            ));
        }

        let head_dim = if let Some(head_dim) = config.head_dim {
            tracing::info!(head_dim, "Using explicit head_dim from config");
            head_dim
        } else {
            if config.hidden_size % config.num_attention_heads != 0 {
                return Err(Error::Configuration(format!(
                    "hidden_size {} is not divisible by num_attention_heads {}",
                    config.hidden_size, config.num_attention_heads
                )));
            }
            config.hidden_size / config.num_attention_heads
        };

        if options.chunk_length == 0 {
            return Err(Error::Configuration("chunk_length must be positive".into()));
        }
        if !(options.memory_limit > 0.0 && options.memory_limit <= 1.0) {
            return Err(Error::Configuration(format!(
                "memory_limit must be in (0, 1], got {}",
                options.memory_limit
            )));
        }

        let embed_scale = config.scale_emb.unwrap_or(1.0);
        let lm_head_scale = config
            .dim_model_base
            .map_or(1.0, |base| base / config.hidden_size as f32);
        let residual_scale = config
            .scale_depth
            .map_or(1.0, |depth| depth / (config.num_hidden_layers as f32).sqrt());

        let attention = match options.sparse {
            Some(sparse) => AttentionVariant::Sparse(sparse),
            None => AttentionVariant::Dense {
                qk_norm: options.use_qk_norm,
                attn_bias: options.use_attn_bias,
            },
        };

        Ok(Self {
            vocab_size: config.vocab_size,
            num_layers: config.num_hidden_layers,
            hidden_size: config.hidden_size,
            intermediate_size: config.intermediate_size,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim,
            rms_norm_eps: config.rms_norm_eps,
            group_size,
            dtype,
            chunk_length: options.chunk_length,
            embed_scale,
            lm_head_scale,
            residual_scale,
            attention,
            max_logit_rows: MAX_LOGIT_ROWS,
        })
    }

    /// Rows of a fused QKV projection: `(q_rows, k_rows, v_rows)`.
    #[must_use]
    pub fn qkv_rows(&self) -> (usize, usize, usize) {
        let q = self.num_heads * self.head_dim;
        let kv = self.num_kv_heads * self.head_dim;
        (q, kv, kv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ModelConfig {
        serde_json::from_str(
            r#"{
                "vocab_size": 1000,
                "hidden_size": 512,
                "intermediate_size": 1024,
                "num_hidden_layers": 4,
                "num_attention_heads": 8,
                "num_key_value_heads": 2,
                "torch_dtype": "float16",
                "quantization_config": {"bits": 4, "group_size": 128}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn derives_head_dim_when_absent() {
        let geometry = ModelGeometry::resolve(&base_config(), &EngineOptions::default()).unwrap();
        assert_eq!(geometry.head_dim, 64);
        assert_eq!(geometry.num_kv_heads, 2);
        assert_eq!(geometry.group_size, 128);
        assert_eq!(geometry.dtype, DType::F16);
        assert_eq!(geometry.max_logit_rows, MAX_LOGIT_ROWS);
    }

    #[test]
    fn honors_explicit_head_dim() {
        let mut config = base_config();
        config.head_dim = Some(128);
        let geometry = ModelGeometry::resolve(&config, &EngineOptions::default()).unwrap();
        assert_eq!(geometry.head_dim, 128);
        assert_eq!(geometry.qkv_rows(), (1024, 256, 256));
    }

    #[test]
    fn neutral_scales_without_hyperparameters() {
        let geometry = ModelGeometry::resolve(&base_config(), &EngineOptions::default()).unwrap();
        assert!((geometry.embed_scale - 1.0).abs() < f32::EPSILON);
        assert!((geometry.lm_head_scale - 1.0).abs() < f32::EPSILON);
        assert!((geometry.residual_scale - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn derives_minicpm_scales() {
        let mut config = base_config();
        config.scale_emb = Some(12.0);
        config.dim_model_base = Some(256.0);
        config.scale_depth = Some(1.4);
        let geometry = ModelGeometry::resolve(&config, &EngineOptions::default()).unwrap();
        assert!((geometry.embed_scale - 12.0).abs() < 1e-6);
        assert!((geometry.lm_head_scale - 0.5).abs() < 1e-6);
        assert!((geometry.residual_scale - 0.7).abs() < 1e-6);
    }

    #[test]
    fn option_dtype_overrides_config() {
        let options = EngineOptions {
            dtype: Some(DType::BF16),
            ..EngineOptions::default()
        };
        let geometry = ModelGeometry::resolve(&base_config(), &options).unwrap();
        assert_eq!(geometry.dtype, DType::BF16);
    }

    #[test]
    fn rejects_unsupported_dtype() {
        let mut config = base_config();
        config.torch_dtype = Some("float32".into());
        let err = ModelGeometry::resolve(&config, &EngineOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn rejects_missing_quantization() {
        let mut config = base_config();
        config.quantization_config = None;
        let err = ModelGeometry::resolve(&config, &EngineOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn sparse_options_select_sparse_variant() {
        let options = EngineOptions {
            sparse: Some(SparseAttentionOptions::default()),
            ..EngineOptions::default()
        };
        let geometry = ModelGeometry::resolve(&base_config(), &options).unwrap();
        assert!(matches!(geometry.attention, AttentionVariant::Sparse(s) if s.topk == 32));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: EngineOptions =
            serde_json::from_str(r#"{"chunk_length": 256, "dtype": "bf16"}"#).unwrap();
        assert_eq!(options.chunk_length, 256);
        assert_eq!(options.dtype, Some(DType::BF16));
        assert!((options.memory_limit - 0.8).abs() < f32::EPSILON);
    }
}
