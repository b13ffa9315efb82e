//! Marlin Runtime: token-level and text-level generation
//!
//! # Architecture
//!
//! ```text
//! Runtime<E, T>      ← text in, text out (owns Engine + Tokenizer)
//!   └── Engine<E>    ← tokens in, tokens out (owns GenerationState)
//!         └── E: ComputeEngine  ← native prefill / decode kernels
//! ```

mod engine;
mod runtime;
mod scheduler;
mod state;
mod stream;

pub use engine::{
    Engine, FinishReason, GenerateOptions, Generation, PrefillEvent, PrefillProgress,
};
pub use runtime::{Completion, Runtime};
pub use scheduler::{generation_budget, plan_chunks, Chunk, ChunkPlan};
pub use state::GenerationState;
pub use stream::{StreamAssembler, StreamEvent, TokenStream};
