mod engine;
pub mod sys;

pub use engine::{NativeEngine, NativeLogits};

// Re-export the cudarc device handle needed to construct an engine
pub use cudarc::driver::CudaDevice;
