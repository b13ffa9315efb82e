//! Host-side tensor buffers read from checkpoint shards.
//!
//! A [`HostTensor`] lives only between reading a shard and handing the
//! tensor to the compute engine; the engine takes ownership of the bytes.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use half::{bf16, f16};

use crate::dtype::DType;
use crate::{Error, Result};

/// Raw tensor data on the host, ready for upload to a compute engine.
///
/// The `data` field holds little-endian bytes in the tensor's `dtype`
/// encoding, row-major over `shape`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Logical shape (e.g., `[out_features, in_features]` for a 2D weight).
    pub shape: Vec<usize>,
    /// Element dtype.
    pub dtype: DType,
    /// Raw bytes in `dtype` encoding.
    pub data: Vec<u8>,
}

impl HostTensor {
    /// Wrap raw bytes, checking they match `shape` and `dtype`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the byte length does not match.
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "tensor of shape {shape:?} ({dtype}) needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// Build an f32 tensor.
    #[must_use]
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            shape,
            dtype: DType::F32,
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Decode every element to f32.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` for integer quantized storage, which has
    /// no meaningful float value element-wise.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let values = match self.dtype {
            DType::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(&self.data),
            DType::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(&self.data)
                .into_iter()
                .map(f16::to_f32)
                .collect(),
            DType::BF16 => bytemuck::pod_collect_to_vec::<u8, bf16>(&self.data)
                .into_iter()
                .map(bf16::to_f32)
                .collect(),
            DType::F64 => bytemuck::pod_collect_to_vec::<u8, f64>(&self.data)
                .into_iter()
                .map(|v| v as f32)
                .collect(),
            DType::I64 => bytemuck::pod_collect_to_vec::<u8, i64>(&self.data)
                .into_iter()
                .map(|v| v as f32)
                .collect(),
            DType::U8 => self.data.iter().map(|&v| f32::from(v)).collect(),
            DType::I32 | DType::I16 | DType::I8 => {
                return Err(Error::UnsupportedDtype(format!(
                    "refusing to reinterpret {} storage as float",
                    self.dtype
                )));
            }
        };
        Ok(values)
    }

    /// Convert to `target` (f32, f16 or bf16).
    ///
    /// A tensor already in `target` is returned unchanged.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` if `target` is not a float kind or the
    /// source is integer quantized storage.
    pub fn cast(self, target: DType) -> Result<Self> {
        if self.dtype == target {
            return Ok(self);
        }
        let values = self.to_f32_vec()?;
        let data = match target {
            DType::F32 => bytemuck::cast_slice(&values).to_vec(),
            DType::F16 => {
                let converted: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
                bytemuck::cast_slice(&converted).to_vec()
            }
            DType::BF16 => {
                let converted: Vec<bf16> = values.iter().map(|&v| bf16::from_f32(v)).collect();
                bytemuck::cast_slice(&converted).to_vec()
            }
            other => {
                return Err(Error::UnsupportedDtype(format!(
                    "cannot cast {} to {other}",
                    self.dtype
                )));
            }
        };
        Ok(Self {
            shape: self.shape,
            dtype: target,
            data,
        })
    }

    /// Copy rows `[start, start + len)` along the first dimension.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the range is out of bounds or the
    /// tensor is a scalar.
    pub fn narrow_rows(&self, start: usize, len: usize) -> Result<Self> {
        let Some((&rows, rest)) = self.shape.split_first() else {
            return Err(Error::InvalidArgument(
                "cannot slice rows of a scalar tensor".into(),
            ));
        };
        if start + len > rows {
            return Err(Error::InvalidArgument(format!(
                "row range {start}..{} out of bounds for {rows} rows",
                start + len
            )));
        }
        let row_bytes = rest.iter().product::<usize>() * self.dtype.size_in_bytes();
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(Self {
            shape,
            dtype: self.dtype,
            data: self.data[start * row_bytes..(start + len) * row_bytes].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checks_byte_length() {
        assert!(HostTensor::new(vec![2, 2], DType::F16, vec![0; 8]).is_ok());
        assert!(HostTensor::new(vec![2, 2], DType::F16, vec![0; 6]).is_err());
    }

    #[test]
    fn cast_f32_to_bf16_and_back() {
        let tensor = HostTensor::from_f32(vec![3], &[1.0, -2.5, 0.125]);
        let bf = tensor.cast(DType::BF16).unwrap();
        assert_eq!(bf.dtype, DType::BF16);
        assert_eq!(bf.data.len(), 6);
        assert_eq!(bf.to_f32_vec().unwrap(), vec![1.0, -2.5, 0.125]);
    }

    #[test]
    fn cast_bf16_to_f16() {
        let tensor = HostTensor::from_f32(vec![2], &[0.5, 4.0])
            .cast(DType::BF16)
            .unwrap();
        let half = tensor.cast(DType::F16).unwrap();
        assert_eq!(half.to_f32_vec().unwrap(), vec![0.5, 4.0]);
    }

    #[test]
    fn cast_same_dtype_is_identity() {
        let tensor = HostTensor::from_f32(vec![1], &[3.0]);
        assert_eq!(tensor.clone().cast(DType::F32).unwrap(), tensor);
    }

    #[test]
    fn int32_is_not_castable() {
        let tensor = HostTensor::new(vec![1], DType::I32, vec![1, 0, 0, 0]).unwrap();
        assert!(matches!(
            tensor.cast(DType::F16),
            Err(Error::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn narrow_rows_slices_first_dim() {
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let tensor = HostTensor::from_f32(vec![4, 3], &values);
        let middle = tensor.narrow_rows(1, 2).unwrap();
        assert_eq!(middle.shape, vec![2, 3]);
        assert_eq!(
            middle.to_f32_vec().unwrap(),
            vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
        assert!(tensor.narrow_rows(3, 2).is_err());
    }
}
