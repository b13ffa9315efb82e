//! Native compute engine for Marlin
//!
//! Binds the GPTQ-Marlin kernel library (`libcpmcu`) through its C ABI and
//! implements [`marlin::ComputeEngine`] on top of it, staging host scalars
//! in `cudarc`-managed device buffers.
//!
//! Without the `native` feature the crate compiles as an empty shell, which
//! lets the workspace build and test on machines without a CUDA toolkit.

// Everything that touches the device lives inside `inner`, so the feature
// gate stays in one place.
#[cfg(feature = "native")]
mod inner;

#[cfg(feature = "native")]
pub use inner::*;

pub use marlin::ComputeEngine;
pub use marlin::Error;
pub use marlin::Result;
