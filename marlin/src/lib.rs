//! Marlin: host-side orchestration for W4A16 GPTQ-Marlin inference
//!
//! This crate holds the core types: model geometry, checkpoint loading,
//! the compute-engine boundary, sampling and tokenization. The generation
//! loop lives in `marlin-runtime`; the native engine binding in
//! `marlin-cuda`.

pub mod backend;
pub mod config;
pub mod dtype;
pub mod error;
pub mod geometry;
pub mod logits;
pub mod rope;
pub mod sampling;
pub mod tokenizer;
pub mod weights;

pub use backend::{AttentionMask, ComputeEngine, DecodeCall, LogitsBuffer, PrefillCall};
pub use config::{ModelConfig, QuantizationConfig, RopeScalingConfig};
pub use dtype::DType;
pub use error::{Error, Result};
pub use geometry::{AttentionVariant, EngineOptions, ModelGeometry, SparseAttentionOptions};
pub use logits::HostLogits;
pub use rope::{RopeFrequencies, RopeScaling};
pub use sampling::Sampler;
pub use tokenizer::{HfTokenizer, Tokenizer};
pub use weights::{CheckpointLoader, HostTensor, LoadReport, WeightAliases, WeightSink};
