//! PyTorch pickle (`.bin` / `.pt`) shard reading.
//!
//! Backed by candle's pickle reader when the `pickle` feature is enabled;
//! otherwise these shards resolve but cannot be loaded.

#![allow(clippy::doc_markdown)]

use std::path::Path;

use super::host::HostTensor;
use crate::Result;

/// Read every tensor in a pickle checkpoint, in name order.
///
/// # Errors
/// Returns an error if the file cannot be parsed, a tensor has an
/// unsupported dtype, or `visit` fails.
#[cfg(feature = "pickle")]
pub fn visit_tensors<F>(path: &Path, mut visit: F) -> Result<usize>
where
    F: FnMut(String, HostTensor) -> Result<()>,
{
    let mut entries = candle_core::pickle::read_all(path)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let count = entries.len();
    for (name, tensor) in entries {
        visit(name, to_host(&tensor)?)?;
    }
    Ok(count)
}

/// Without the `pickle` feature there is no reader for this format.
///
/// # Errors
/// Always returns `UnsupportedFormat`.
#[cfg(not(feature = "pickle"))]
pub fn visit_tensors<F>(path: &Path, _visit: F) -> Result<usize>
where
    F: FnMut(String, HostTensor) -> Result<()>,
{
    Err(crate::Error::UnsupportedFormat(format!(
        "{} is a PyTorch pickle; rebuild with the `pickle` feature or convert it to safetensors",
        path.display()
    )))
}

#[cfg(feature = "pickle")]
fn to_host(tensor: &candle_core::Tensor) -> Result<HostTensor> {
    use crate::dtype::DType;
    use candle_core::DType as CDType;

    let shape = tensor.dims().to_vec();
    let flat = tensor.flatten_all()?;
    let (dtype, data): (DType, Vec<u8>) = match tensor.dtype() {
        CDType::F32 => (DType::F32, bytes_of(&flat.to_vec1::<f32>()?)),
        CDType::F16 => (DType::F16, bytes_of(&flat.to_vec1::<half::f16>()?)),
        CDType::BF16 => (DType::BF16, bytes_of(&flat.to_vec1::<half::bf16>()?)),
        CDType::F64 => (DType::F64, bytes_of(&flat.to_vec1::<f64>()?)),
        CDType::I64 => (DType::I64, bytes_of(&flat.to_vec1::<i64>()?)),
        CDType::U8 => (DType::U8, flat.to_vec1::<u8>()?),
        // packed int32 quant storage surfaces as u32; the bits are what matter
        CDType::U32 => (DType::I32, bytes_of(&flat.to_vec1::<u32>()?)),
        other => {
            return Err(crate::Error::UnsupportedDtype(format!(
                "pickle tensor dtype {other:?}"
            )));
        }
    };
    HostTensor::new(shape, dtype, data)
}

#[cfg(feature = "pickle")]
fn bytes_of<T: bytemuck::Pod>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

#[cfg(all(test, not(feature = "pickle")))]
mod tests {
    use super::*;

    #[test]
    fn pickle_without_feature_is_unsupported() {
        let err = visit_tensors(Path::new("pytorch_model.bin"), |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, crate::Error::UnsupportedFormat(_)));
    }
}
