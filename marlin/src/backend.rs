//! Compute-engine boundary.
//!
//! The quantized matmul, attention and normalization kernels live in a
//! native library. The orchestration layer only sees [`ComputeEngine`]:
//! a handful of synchronous calls that take host scalars, write into a
//! device-resident logits buffer, and expose those logits to the host on
//! demand.
//!
//! Call order is fixed: `init_model` → `init_storage` → weight loading
//! (via the [`WeightSink`] supertrait) → any number of `prefill` /
//! `decode` calls.

use crate::dtype::DType;
use crate::geometry::ModelGeometry;
use crate::logits::HostLogits;
use crate::weights::WeightSink;
use crate::{Error, Result};

/// Device-resident logits buffer of `rows × vocab_size` activations.
pub trait LogitsBuffer {
    /// Rows the buffer can hold.
    fn rows(&self) -> usize;

    /// Vocabulary size (values per row).
    fn vocab_size(&self) -> usize;
}

/// One prefill chunk.
#[derive(Debug, Clone, Copy)]
pub struct PrefillCall<'a> {
    /// Token ids of this chunk only.
    pub tokens: &'a [i32],
    /// Position ids of this chunk only.
    pub positions: &'a [i32],
    /// Absolute start of the chunk within the whole prompt.
    pub offset: usize,
}

impl PrefillCall<'_> {
    /// Tokens in this chunk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Per-row attention visibility for multi-token decode.
///
/// Row `i` is a bitmask over the submitted tokens: bit `j` set means token
/// `i` may attend to token `j` of the same step. Cached tokens are always
/// visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMask {
    rows: Vec<u64>,
}

impl AttentionMask {
    /// Build a mask from one bitmask per submitted token.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if there are more than 64 rows (one
    /// `u64` cannot address them).
    pub fn from_rows(rows: Vec<u64>) -> Result<Self> {
        if rows.len() > 64 {
            return Err(Error::InvalidArgument(format!(
                "attention mask supports at most 64 rows, got {}",
                rows.len()
            )));
        }
        Ok(Self { rows })
    }

    /// Lower-triangular mask over `n` tokens.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `n > 64`.
    pub fn causal(n: usize) -> Result<Self> {
        let rows = (0..n)
            .map(|i| if i >= 63 { u64::MAX } else { (1u64 << (i + 1)) - 1 })
            .collect();
        Self::from_rows(rows)
    }

    #[must_use]
    pub fn rows(&self) -> &[u64] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One decode step.
#[derive(Debug, Clone, Copy)]
pub struct DecodeCall<'a> {
    /// Tokens submitted in this step.
    pub n_tokens: usize,
    /// `cache_len + n_tokens` rounded up to a multiple of 128.
    pub padded_cache_len: usize,
    pub tokens: &'a [i32],
    pub positions: &'a [i32],
    /// Cache length as seen by the device (already incremented).
    pub cache_lengths: &'a [i32],
    /// `None` for ordinary single-token decode.
    pub mask: Option<&'a AttentionMask>,
    /// Replay the captured fixed-shape graph instead of launching kernels.
    pub use_graph: bool,
}

/// A native compute engine driven by the orchestration layer.
#[allow(clippy::missing_errors_doc)]
pub trait ComputeEngine: WeightSink {
    /// Device logits buffer type.
    type Logits: LogitsBuffer;

    /// Lay out model state for `geometry`, claiming at most
    /// `memory_limit` of device memory.
    fn init_model(&mut self, memory_limit: f32, geometry: &ModelGeometry) -> Result<()>;

    /// Allocate the key/value cache and return the largest total sequence
    /// length it can hold. Called once per engine.
    fn init_storage(&mut self) -> Result<usize>;

    /// Allocate a zeroed `rows × vocab_size` logits buffer in `dtype`.
    fn alloc_logits(&mut self, rows: usize, vocab_size: usize, dtype: DType) -> Result<Self::Logits>;

    /// Run one prefill chunk. Row 0 of `logits` holds the next-token
    /// logits for the last token of the chunk.
    fn prefill(&mut self, call: PrefillCall<'_>, logits: &mut Self::Logits) -> Result<()>;

    /// Run one decode step, writing `call.n_tokens` rows of `logits`.
    fn decode(&mut self, call: DecodeCall<'_>, logits: &mut Self::Logits) -> Result<()>;

    /// Copy the first `rows` rows of `logits` to the host as f32.
    fn logits_to_host(&self, logits: &Self::Logits, rows: usize) -> Result<HostLogits>;

    /// Print kernel timing statistics.
    fn print_perf_summary(&self) {}
}

/// Smallest multiple of 128 that is at least `len`.
#[must_use]
pub const fn pad_to_128(len: usize) -> usize {
    len.div_ceil(128) * 128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_rounds_up_to_128() {
        assert_eq!(pad_to_128(1), 128);
        assert_eq!(pad_to_128(128), 128);
        assert_eq!(pad_to_128(129), 256);
        assert_eq!(pad_to_128(0), 0);
    }

    #[test]
    fn padding_covers_every_length() {
        for len in 0..=4096 {
            let padded = pad_to_128(len);
            assert_eq!(padded % 128, 0);
            assert!(padded >= len && padded < len + 128);
        }
    }

    #[test]
    fn causal_mask_is_lower_triangular() {
        let mask = AttentionMask::causal(3).unwrap();
        assert_eq!(mask.rows(), &[0b1, 0b11, 0b111]);
    }

    #[test]
    fn causal_mask_handles_full_width() {
        let mask = AttentionMask::causal(64).unwrap();
        assert_eq!(mask.rows()[63], u64::MAX);
        assert_eq!(mask.rows()[62], u64::MAX >> 1);
        assert!(AttentionMask::causal(65).is_err());
    }
}
