//! RoPE (Rotary Positional Embeddings) inverse-frequency derivation.
//!
//! Pure host-side computation. The compute engine builds its cos/sin tables
//! from the `inv_freq` vector loaded under [`INV_FREQ_WEIGHT`], so only the
//! per-dimension frequencies are produced here, always as f32.

#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::doc_markdown
)]

use crate::config::{ModelConfig, RopeScalingConfig};
use crate::{Error, Result};

/// Reserved weight name the compute engine reads rotary frequencies from.
pub const INV_FREQ_WEIGHT: &str = "model.rotary_emb.inv_freq";

/// Rotary scaling strategy, selected by the `rope_scaling.rope_type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum RopeScaling {
    /// Plain RoPE: `1 / base^(2i/d)`.
    Default,
    /// Uniform position interpolation: every frequency divided by `factor`.
    Linear { factor: f32 },
    /// Llama 3 band-wise interpolation.
    ///
    /// Long wavelengths are divided by `factor`, short ones are kept, and
    /// the band in between is smoothly blended.
    Llama3 {
        factor: f32,
        low_freq_factor: f32,
        high_freq_factor: f32,
        original_max_position_embeddings: usize,
    },
    /// LongRoPE: per-dimension rescale factors, with a separate set used
    /// once the context grows past the original training length.
    LongRope {
        short_factor: Vec<f32>,
        long_factor: Vec<f32>,
        factor: f32,
        original_max_position_embeddings: usize,
    },
}

/// Output of a rope strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeFrequencies {
    /// One frequency per rotated dimension pair.
    pub inv_freq: Vec<f32>,
    /// Magnitude correction for attention logits (1.0 when unused).
    pub attention_scaling: f32,
}

impl RopeScaling {
    /// Select the strategy declared by `config.rope_scaling`.
    ///
    /// # Errors
    /// Returns `Configuration` for unknown tags or missing parameters.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let Some(scaling) = config.rope_scaling.as_ref() else {
            return Ok(Self::Default);
        };
        let kind = scaling.kind().unwrap_or("default");
        match kind {
            "default" => Ok(Self::Default),
            "linear" => Ok(Self::Linear {
                factor: require(scaling.factor, "factor", kind)?,
            }),
            "llama3" => Ok(Self::Llama3 {
                factor: require(scaling.factor, "factor", kind)?,
                low_freq_factor: require(scaling.low_freq_factor, "low_freq_factor", kind)?,
                high_freq_factor: require(scaling.high_freq_factor, "high_freq_factor", kind)?,
                original_max_position_embeddings: require(
                    scaling.original_max_position_embeddings,
                    "original_max_position_embeddings",
                    kind,
                )?,
            }),
            "longrope" => Ok(longrope_from_config(config, scaling)?),
            other => Err(Error::Configuration(format!(
                "unsupported rope_scaling type '{other}' (supported: default, linear, llama3, longrope)"
            ))),
        }
    }

    /// Compute inverse frequencies for a rotary dimension of `dim`, sized
    /// for sequences up to `seq_len` tokens.
    ///
    /// # Errors
    /// Returns `Configuration` if `dim` is odd or zero, or if longrope
    /// factor lists do not cover `dim / 2` entries.
    pub fn inv_freq(&self, dim: usize, base: f32, seq_len: usize) -> Result<RopeFrequencies> {
        if dim == 0 || dim % 2 != 0 {
            return Err(Error::Configuration(format!(
                "rotary dimension must be even and non-zero, got {dim}"
            )));
        }
        let base_freq = default_inv_freq(dim, base);

        match self {
            Self::Default => Ok(RopeFrequencies {
                inv_freq: base_freq,
                attention_scaling: 1.0,
            }),
            Self::Linear { factor } => Ok(RopeFrequencies {
                inv_freq: base_freq.iter().map(|f| f / factor).collect(),
                attention_scaling: 1.0,
            }),
            Self::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_max_position_embeddings,
            } => {
                let old_ctx = *original_max_position_embeddings as f32;
                let low_freq_wavelen = old_ctx / low_freq_factor;
                let high_freq_wavelen = old_ctx / high_freq_factor;

                let inv_freq = base_freq
                    .iter()
                    .map(|&freq| {
                        let wavelen = 2.0 * std::f32::consts::PI / freq;
                        if wavelen < high_freq_wavelen {
                            freq
                        } else if wavelen > low_freq_wavelen {
                            freq / factor
                        } else {
                            let smooth = (old_ctx / wavelen - low_freq_factor)
                                / (high_freq_factor - low_freq_factor);
                            (1.0 - smooth) * freq / factor + smooth * freq
                        }
                    })
                    .collect();
                Ok(RopeFrequencies {
                    inv_freq,
                    attention_scaling: 1.0,
                })
            }
            Self::LongRope {
                short_factor,
                long_factor,
                factor,
                original_max_position_embeddings,
            } => {
                let ext = if seq_len > *original_max_position_embeddings {
                    long_factor
                } else {
                    short_factor
                };
                if ext.len() != dim / 2 {
                    return Err(Error::Configuration(format!(
                        "longrope factors have {} entries, expected {}",
                        ext.len(),
                        dim / 2
                    )));
                }
                let attention_scaling = if *factor <= 1.0 {
                    1.0
                } else {
                    (1.0 + factor.ln() / (*original_max_position_embeddings as f32).ln()).sqrt()
                };
                let inv_freq = base_freq.iter().zip(ext).map(|(f, e)| f / e).collect();
                Ok(RopeFrequencies {
                    inv_freq,
                    attention_scaling,
                })
            }
        }
    }
}

/// Rotary frequencies for `config`, bounded by the engine's `max_total_length`.
///
/// # Errors
/// Propagates strategy selection and derivation errors.
pub fn rope_frequencies(
    config: &ModelConfig,
    head_dim: usize,
    max_total_length: usize,
) -> Result<RopeFrequencies> {
    let partial = config.partial_rotary_factor.unwrap_or(1.0);
    let dim = (head_dim as f32 * partial) as usize;
    RopeScaling::from_config(config)?.inv_freq(dim, config.rope_theta, max_total_length)
}

fn default_inv_freq(dim: usize, base: f32) -> Vec<f32> {
    (0..dim / 2)
        .map(|i| 1.0 / base.powf(2.0 * i as f32 / dim as f32))
        .collect()
}

fn require<T>(value: Option<T>, field: &str, kind: &str) -> Result<T> {
    value.ok_or_else(|| Error::Configuration(format!("rope_scaling '{kind}' requires '{field}'")))
}

fn longrope_from_config(config: &ModelConfig, scaling: &RopeScalingConfig) -> Result<RopeScaling> {
    let short_factor = require(scaling.short_factor.clone(), "short_factor", "longrope")?;
    let long_factor = require(scaling.long_factor.clone(), "long_factor", "longrope")?;

    // Switch length follows the HF reference: the top-level original length
    // when declared (which also fixes the extension factor), otherwise
    // `max_position_embeddings`. The block's own original length is unused.
    let (original, factor) = match config.original_max_position_embeddings {
        Some(original) => (
            original,
            config.max_position_embeddings as f32 / original as f32,
        ),
        None => (
            config.max_position_embeddings,
            scaling.factor.unwrap_or(1.0),
        ),
    };

    Ok(RopeScaling::LongRope {
        short_factor,
        long_factor,
        factor,
        original_max_position_embeddings: original,
    })
}
