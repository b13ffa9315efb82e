//! Error types for Marlin

use thiserror::Error;

/// Result type alias using Marlin's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Marlin operations
#[derive(Error, Debug)]
pub enum Error {
    /// Model metadata cannot be turned into an engine geometry
    /// (unsupported dtype, missing quantization config, bad head layout).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The checkpoint directory holds no usable checkpoint, or more than one.
    #[error("Checkpoint resolution error: {0}")]
    CheckpointResolution(String),

    /// A request would push the sequence past the storage capacity.
    /// Raised before any device call, so nothing needs to be undone.
    #[error("Input token count ({requested}) exceeds maximum supported length ({max}) under current memory limit")]
    CapacityExceeded { requested: usize, max: usize },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Unsupported checkpoint format: {0}")]
    UnsupportedFormat(String),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Optional From impls for backend error types
// ---------------------------------------------------------------------------

#[cfg(feature = "cuda-errors")]
impl From<cudarc::driver::DriverError> for Error {
    fn from(e: cudarc::driver::DriverError) -> Self {
        Self::Device(e.to_string())
    }
}

#[cfg(feature = "pickle")]
impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Self::UnsupportedFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_names_both_lengths() {
        let err = Error::CapacityExceeded {
            requested: 5000,
            max: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("5000"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
