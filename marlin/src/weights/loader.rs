//! Checkpoint-to-engine weight handoff.
//!
//! [`CheckpointLoader`] walks the shard files of a resolved checkpoint and
//! passes each named tensor to a [`WeightSink`] (the compute engine),
//! converting dtypes on the way:
//!
//! - integer quantized storage (`i8`/`i16`/`i32`) is passed through as is,
//! - rotary-embedding tensors are always widened to f32,
//! - everything else is cast to the engine's activation dtype.
//!
//! Declared aliases (tied embeddings) are applied after each handoff, and
//! fused projections can optionally be split into their parts.

#![allow(clippy::module_name_repetitions)]

use std::path::{Path, PathBuf};

use super::host::HostTensor;
use super::resolve::{resolve_checkpoint, ShardFormat};
use crate::config::ModelConfig;
use crate::dtype::DType;
use crate::geometry::ModelGeometry;
use crate::rope::{rope_frequencies, INV_FREQ_WEIGHT};
use crate::{Error, Result};

/// Input embedding table name.
pub const EMBED_TOKENS_WEIGHT: &str = "model.embed_tokens.weight";
/// Output projection name.
pub const LM_HEAD_WEIGHT: &str = "lm_head.weight";

/// Destination for named host tensors; implemented by compute engines.
pub trait WeightSink {
    /// Take ownership of `tensor` under `name`.
    ///
    /// # Errors
    /// Returns an error if the engine rejects the weight.
    fn load_weight(&mut self, name: &str, tensor: HostTensor) -> Result<()>;
}

/// Names that receive a copy of another weight once it is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightAliases {
    entries: Vec<(String, Vec<String>)>,
}

impl WeightAliases {
    /// No aliases.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// The embedding table doubles as the lm head.
    #[must_use]
    pub fn tied_embeddings() -> Self {
        Self::none().with(EMBED_TOKENS_WEIGHT, [LM_HEAD_WEIGHT])
    }

    /// Aliases implied by `config.json`.
    #[must_use]
    pub fn from_config(config: &ModelConfig) -> Self {
        if config.tie_word_embeddings {
            Self::tied_embeddings()
        } else {
            Self::none()
        }
    }

    /// Add an alias entry.
    #[must_use]
    pub fn with<I, S>(mut self, source: &str, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.push((
            source.to_owned(),
            targets.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Alias targets for `name`.
    #[must_use]
    pub fn targets(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(source, _)| source == name)
            .map_or(&[], |(_, targets)| targets.as_slice())
    }
}

/// Row layout for splitting fused projections along dim 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusedSplit {
    q_rows: usize,
    kv_rows: usize,
    intermediate_size: usize,
}

impl FusedSplit {
    /// Row offsets derived from the model geometry.
    #[must_use]
    pub fn from_geometry(geometry: &ModelGeometry) -> Self {
        let (q_rows, kv_rows, _) = geometry.qkv_rows();
        Self {
            q_rows,
            kv_rows,
            intermediate_size: geometry.intermediate_size,
        }
    }

    /// Split a fused tensor into named parts, or `None` if `name` is not fused.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the first dimension does not match the
    /// fused layout (for example a packed quantized tensor whose output
    /// features are not on dim 0).
    pub fn split(&self, name: &str, tensor: &HostTensor) -> Result<Option<Vec<(String, HostTensor)>>> {
        let rows = tensor.shape.first().copied().unwrap_or(0);
        if name.contains(".qkv_proj.") {
            let expected = self.q_rows + 2 * self.kv_rows;
            check_rows(name, rows, expected)?;
            return Ok(Some(vec![
                (
                    name.replace(".qkv_proj.", ".q_proj."),
                    tensor.narrow_rows(0, self.q_rows)?,
                ),
                (
                    name.replace(".qkv_proj.", ".k_proj."),
                    tensor.narrow_rows(self.q_rows, self.kv_rows)?,
                ),
                (
                    name.replace(".qkv_proj.", ".v_proj."),
                    tensor.narrow_rows(self.q_rows + self.kv_rows, self.kv_rows)?,
                ),
            ]));
        }
        if name.contains(".gate_up_proj.") {
            check_rows(name, rows, 2 * self.intermediate_size)?;
            let half = self.intermediate_size;
            return Ok(Some(vec![
                (
                    name.replace(".gate_up_proj.", ".gate_proj."),
                    tensor.narrow_rows(0, half)?,
                ),
                (
                    name.replace(".gate_up_proj.", ".up_proj."),
                    tensor.narrow_rows(half, half)?,
                ),
            ]));
        }
        Ok(None)
    }
}

fn check_rows(name: &str, rows: usize, expected: usize) -> Result<()> {
    if rows == expected {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "cannot split fused tensor '{name}': dim 0 is {rows}, expected {expected}"
        )))
    }
}

/// Counters from a checkpoint load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Shard files read.
    pub files: usize,
    /// Tensors found in the checkpoint.
    pub tensors: usize,
    /// Weights handed to the engine (including aliases and split parts).
    pub handed_off: usize,
}

/// Streams checkpoint tensors into a [`WeightSink`].
#[derive(Debug, Clone)]
pub struct CheckpointLoader {
    dtype: DType,
    aliases: WeightAliases,
    fused_split: Option<FusedSplit>,
}

impl CheckpointLoader {
    /// A loader casting float weights to `dtype`.
    #[must_use]
    pub fn new(dtype: DType, aliases: WeightAliases) -> Self {
        Self {
            dtype,
            aliases,
            fused_split: None,
        }
    }

    /// Split fused projections before handoff.
    #[must_use]
    pub fn with_fused_split(mut self, split: FusedSplit) -> Self {
        self.fused_split = Some(split);
        self
    }

    /// Resolve `dir` and load every tensor of the resolved checkpoint.
    ///
    /// # Errors
    /// Returns `CheckpointResolution` before touching the sink if the
    /// directory is ambiguous or empty; otherwise propagates read, cast or
    /// sink errors.
    pub fn load(&self, dir: impl AsRef<Path>, sink: &mut dyn WeightSink) -> Result<LoadReport> {
        let source = resolve_checkpoint(dir)?;
        tracing::info!(%source, "Resolved checkpoint");
        let files = source.shard_files()?;
        self.load_files(&files, sink)
    }

    /// Load the given shard files in order.
    ///
    /// # Errors
    /// Propagates read, cast or sink errors.
    pub fn load_files(&self, files: &[PathBuf], sink: &mut dyn WeightSink) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for file in files {
            tracing::info!(file = %file.display(), "load from");
            let mut handoff = |name: String, tensor: HostTensor| -> Result<()> {
                report.handed_off += self.handoff(&name, tensor, sink)?;
                Ok(())
            };
            let count = match ShardFormat::from_path(file)? {
                ShardFormat::SafeTensors => super::safetensors::visit_tensors(file, &mut handoff)?,
                ShardFormat::Pickle => super::pickle::visit_tensors(file, &mut handoff)?,
            };
            report.tensors += count;
            report.files += 1;
        }
        Ok(report)
    }

    /// Hand one named tensor (and its aliases) to the sink.
    ///
    /// Returns the number of weights the sink received.
    ///
    /// # Errors
    /// Propagates split, cast and sink errors.
    pub fn handoff(&self, name: &str, tensor: HostTensor, sink: &mut dyn WeightSink) -> Result<usize> {
        if let Some(split) = &self.fused_split {
            if let Some(parts) = split.split(name, &tensor)? {
                let mut loaded = 0;
                for (part_name, part) in parts {
                    loaded += self.handoff_one(&part_name, part, sink)?;
                }
                return Ok(loaded);
            }
        }
        self.handoff_one(name, tensor, sink)
    }

    fn handoff_one(&self, name: &str, tensor: HostTensor, sink: &mut dyn WeightSink) -> Result<usize> {
        let tensor = if tensor.dtype.is_quantized_storage() {
            tensor
        } else if name.contains("rotary_emb") {
            tensor.cast(DType::F32)?
        } else {
            tensor.cast(self.dtype)?
        };

        let targets = self.aliases.targets(name);
        let copies: Vec<(String, HostTensor)> = targets
            .iter()
            .map(|target| (target.clone(), tensor.clone()))
            .collect();

        sink.load_weight(name, tensor)?;
        for (target, copy) in copies {
            sink.load_weight(&target, copy)?;
        }
        Ok(1 + targets.len())
    }

    /// Derive rotary inverse frequencies and load them under the reserved
    /// [`INV_FREQ_WEIGHT`] name as f32.
    ///
    /// `max_total_length` must come from storage initialisation; the long
    /// context strategies pick their factors from it.
    ///
    /// # Errors
    /// Propagates rope derivation and sink errors.
    pub fn load_rotary(
        &self,
        config: &ModelConfig,
        head_dim: usize,
        max_total_length: usize,
        sink: &mut dyn WeightSink,
    ) -> Result<()> {
        let freqs = rope_frequencies(config, head_dim, max_total_length)?;
        tracing::debug!(
            dims = freqs.inv_freq.len(),
            attention_scaling = freqs.attention_scaling,
            "Loading rotary frequencies"
        );
        let tensor = HostTensor::from_f32(vec![freqs.inv_freq.len()], &freqs.inv_freq);
        sink.load_weight(INV_FREQ_WEIGHT, tensor)
    }
}
