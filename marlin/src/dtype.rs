//! Data types for tensor elements

use std::fmt;

use serde::Deserialize;

use crate::{Error, Result};

/// Element types that can appear in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 64-bit floating point
    F64,
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// 64-bit signed integer
    I64,
    /// 32-bit signed integer (GPTQ packed weights, zero points, `g_idx`)
    I32,
    /// 16-bit signed integer
    I16,
    /// 8-bit signed integer
    I8,
    /// 8-bit unsigned integer
    U8,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 | Self::I16 => 2,
            Self::I8 | Self::U8 => 1,
        }
    }

    /// Integer storage kinds that hold quantized payloads.
    ///
    /// These are handed to the compute engine byte-for-byte; every other
    /// kind is cast to the engine's floating dtype first.
    #[must_use]
    pub const fn is_quantized_storage(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32)
    }

    /// Whether the compute engine can run activations in this dtype.
    #[must_use]
    pub const fn is_engine_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    /// Integer code the compute engine expects for its activation dtype.
    ///
    /// # Errors
    /// Returns `Configuration` for anything but f16 / bf16.
    pub fn engine_code(self) -> Result<i32> {
        match self {
            Self::F16 => Ok(0),
            Self::BF16 => Ok(1),
            other => Err(Error::Configuration(format!("Unsupported dtype: {other}"))),
        }
    }

    /// Parse a HuggingFace `torch_dtype` string (`"float16"`, `"bfloat16"`, ...).
    #[must_use]
    pub fn from_torch_name(s: &str) -> Option<Self> {
        match s.trim_start_matches("torch.") {
            "float64" | "double" => Some(Self::F64),
            "float32" | "float" => Some(Self::F32),
            "float16" | "half" => Some(Self::F16),
            "bfloat16" => Some(Self::BF16),
            "int64" | "long" => Some(Self::I64),
            "int32" | "int" => Some(Self::I32),
            "int16" | "short" => Some(Self::I16),
            "int8" => Some(Self::I8),
            "uint8" => Some(Self::U8),
            _ => None,
        }
    }

    /// Convert from a safetensors header dtype.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` for kinds with no checkpoint meaning here
    /// (bool, unsigned wide ints, fp8).
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F64 => Ok(Self::F64),
            safetensors::Dtype::F32 => Ok(Self::F32),
            safetensors::Dtype::F16 => Ok(Self::F16),
            safetensors::Dtype::BF16 => Ok(Self::BF16),
            safetensors::Dtype::I64 => Ok(Self::I64),
            safetensors::Dtype::I32 => Ok(Self::I32),
            safetensors::Dtype::I16 => Ok(Self::I16),
            safetensors::Dtype::I8 => Ok(Self::I8),
            safetensors::Dtype::U8 => Ok(Self::U8),
            other => Err(Error::UnsupportedDtype(format!("{other:?}"))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::I64 => "i64",
            Self::I32 => "i32",
            Self::I16 => "i16",
            Self::I8 => "i8",
            Self::U8 => "u8",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::I8.size_in_bytes(), 1);
    }

    #[test]
    fn test_quantized_storage_kinds() {
        assert!(DType::I32.is_quantized_storage());
        assert!(DType::I16.is_quantized_storage());
        assert!(DType::I8.is_quantized_storage());
        assert!(!DType::I64.is_quantized_storage());
        assert!(!DType::U8.is_quantized_storage());
        assert!(!DType::F16.is_quantized_storage());
    }

    #[test]
    fn test_engine_code() {
        assert_eq!(DType::F16.engine_code().unwrap(), 0);
        assert_eq!(DType::BF16.engine_code().unwrap(), 1);
        assert!(matches!(
            DType::F32.engine_code(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_from_torch_name() {
        assert_eq!(DType::from_torch_name("bfloat16"), Some(DType::BF16));
        assert_eq!(DType::from_torch_name("torch.float16"), Some(DType::F16));
        assert_eq!(DType::from_torch_name("float8"), None);
    }

    #[test]
    fn test_safetensors_mapping() {
        assert_eq!(
            DType::from_safetensors(safetensors::Dtype::I32).unwrap(),
            DType::I32
        );
        assert!(DType::from_safetensors(safetensors::Dtype::BOOL).is_err());
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(format!("{}", DType::F32), "f32");
        assert_eq!(format!("{}", DType::BF16), "bf16");
        assert_eq!(format!("{}", DType::I32), "i32");
    }
}
