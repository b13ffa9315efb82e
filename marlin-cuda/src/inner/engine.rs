//! [`ComputeEngine`] implementation over the native kernel library.
//!
//! Host slices handed over by the runtime are staged into fixed device
//! buffers allocated once at `init_model`, so a captured decode graph
//! always reads the same addresses.

use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, DeviceSlice};
use half::{bf16, f16};

use marlin::backend::{ComputeEngine, DecodeCall, LogitsBuffer, PrefillCall};
use marlin::geometry::MAX_LOGIT_ROWS;
use marlin::{AttentionVariant, DType, Error, HostLogits, HostTensor, ModelGeometry, Result, WeightSink};

use super::sys;

/// Device logits buffer: `rows × vocab_size` f16/bf16 values.
pub struct NativeLogits {
    buffer: CudaSlice<u16>,
    rows: usize,
    vocab_size: usize,
    dtype: DType,
}

impl LogitsBuffer for NativeLogits {
    fn rows(&self) -> usize {
        self.rows
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

/// Fixed device staging buffers for step inputs.
struct Staging {
    tokens: CudaSlice<i32>,
    positions: CudaSlice<i32>,
    cache_length: CudaSlice<i32>,
    mask: CudaSlice<u64>,
}

/// The native engine. One per process: the kernel library keeps global state.
pub struct NativeEngine {
    device: Arc<CudaDevice>,
    geometry: Option<ModelGeometry>,
    staging: Option<Staging>,
    max_total_length: Option<usize>,
}

impl NativeEngine {
    /// Bind to device `ordinal`.
    ///
    /// # Errors
    /// Returns an error if the device cannot be opened.
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal)?;
        Ok(Self::with_device(device))
    }

    #[must_use]
    pub fn with_device(device: Arc<CudaDevice>) -> Self {
        Self {
            device,
            geometry: None,
            staging: None,
            max_total_length: None,
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    fn staging(&mut self) -> Result<&mut Staging> {
        self.staging
            .as_mut()
            .ok_or_else(|| Error::Device("init_model has not been called".into()))
    }

    /// Surface asynchronous kernel failures as errors.
    fn sync(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}

fn to_c_int(value: usize, what: &str) -> Result<c_int> {
    c_int::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("{what} {value} does not fit in a C int")))
}

impl WeightSink for NativeEngine {
    fn load_weight(&mut self, name: &str, tensor: HostTensor) -> Result<()> {
        if self.staging.is_none() {
            return Err(Error::Device(format!(
                "cannot load {name} before init_model"
            )));
        }
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalidArgument(format!("weight name contains NUL: {name:?}")))?;
        // SAFETY: `tensor.data` is host memory that outlives the call; the
        // library copies it to the device before returning.
        unsafe { sys::load_model(c_name.as_ptr(), host_ptr(&tensor)) };
        self.sync()?;
        tracing::trace!(name, dtype = %tensor.dtype, shape = ?tensor.shape, "loaded weight");
        Ok(())
    }
}

impl ComputeEngine for NativeEngine {
    type Logits = NativeLogits;

    fn init_model(&mut self, memory_limit: f32, geometry: &ModelGeometry) -> Result<()> {
        if self.geometry.is_some() {
            return Err(Error::Device("model already initialised in this process".into()));
        }
        let vocab_size = to_c_int(geometry.vocab_size, "vocab_size")?;
        let num_layers = to_c_int(geometry.num_layers, "num_hidden_layers")?;
        let hidden_size = to_c_int(geometry.hidden_size, "hidden_size")?;
        let intermediate_size = to_c_int(geometry.intermediate_size, "intermediate_size")?;
        let num_heads = to_c_int(geometry.num_heads, "num_attention_heads")?;
        let num_kv_heads = to_c_int(geometry.num_kv_heads, "num_key_value_heads")?;
        let head_dim = to_c_int(geometry.head_dim, "head_dim")?;
        let chunk_length = to_c_int(geometry.chunk_length, "chunk_length")?;
        let dtype = geometry.dtype.engine_code()?;

        match geometry.attention {
            AttentionVariant::Sparse(sparse) => {
                tracing::info!(?sparse, "Initializing sparse-attention model");
                let sink = to_c_int(sparse.sink_window_size, "sink_window_size")?;
                let block = to_c_int(sparse.block_window_size, "block_window_size")?;
                let topk = to_c_int(sparse.topk, "topk")?;
                let switch = to_c_int(sparse.switch_threshold, "switch_threshold")?;
                // SAFETY: plain scalar arguments; the library allocates its own state.
                unsafe {
                    sys::init_w4a16_gptq_marlin_minicpm4_model(
                        memory_limit,
                        vocab_size,
                        num_layers,
                        hidden_size,
                        intermediate_size,
                        num_heads,
                        num_kv_heads,
                        head_dim,
                        geometry.rms_norm_eps,
                        geometry.group_size,
                        dtype,
                        chunk_length,
                        geometry.embed_scale,
                        geometry.lm_head_scale,
                        geometry.residual_scale,
                        sink,
                        block,
                        topk,
                        switch,
                        sparse.use_compress_lse,
                    );
                }
            }
            AttentionVariant::Dense { qk_norm, attn_bias } => {
                tracing::info!(qk_norm, attn_bias, "Initializing dense-attention model");
                // SAFETY: as above.
                unsafe {
                    sys::init_w4a16_gptq_marlin_base_model(
                        memory_limit,
                        vocab_size,
                        num_layers,
                        hidden_size,
                        intermediate_size,
                        num_heads,
                        num_kv_heads,
                        head_dim,
                        geometry.rms_norm_eps,
                        geometry.group_size,
                        dtype,
                        chunk_length,
                        geometry.embed_scale,
                        geometry.lm_head_scale,
                        geometry.residual_scale,
                        qk_norm,
                        attn_bias,
                    );
                }
            }
        }
        self.sync()?;

        let step_len = geometry.chunk_length.max(MAX_LOGIT_ROWS);
        self.staging = Some(Staging {
            tokens: self.device.alloc_zeros::<i32>(step_len)?,
            positions: self.device.alloc_zeros::<i32>(step_len)?,
            cache_length: self.device.alloc_zeros::<i32>(1)?,
            mask: self.device.alloc_zeros::<u64>(MAX_LOGIT_ROWS)?,
        });
        self.geometry = Some(geometry.clone());
        Ok(())
    }

    fn init_storage(&mut self) -> Result<usize> {
        if self.geometry.is_none() {
            return Err(Error::Device("init_storage before init_model".into()));
        }
        if self.max_total_length.is_some() {
            return Err(Error::Device("storage is already initialised".into()));
        }
        // SAFETY: no arguments; the model has been initialised above.
        let max = unsafe { sys::init_storage() };
        self.sync()?;
        let max = usize::try_from(max)
            .map_err(|_| Error::Device(format!("init_storage returned {max}")))?;
        self.max_total_length = Some(max);
        Ok(max)
    }

    fn alloc_logits(&mut self, rows: usize, vocab_size: usize, dtype: DType) -> Result<NativeLogits> {
        if !dtype.is_engine_float() {
            return Err(Error::UnsupportedDtype(format!("logits in {dtype}")));
        }
        let buffer = self.device.alloc_zeros::<u16>(rows * vocab_size)?;
        Ok(NativeLogits {
            buffer,
            rows,
            vocab_size,
            dtype,
        })
    }

    fn prefill(&mut self, call: PrefillCall<'_>, logits: &mut NativeLogits) -> Result<()> {
        let len = to_c_int(call.len(), "chunk length")?;
        let offset = to_c_int(call.offset, "chunk offset")?;
        let device = Arc::clone(&self.device);
        let staging = self.staging()?;
        if call.len() > staging.tokens.len() {
            return Err(Error::InvalidArgument(format!(
                "chunk of {} tokens exceeds staging capacity {}",
                call.len(),
                staging.tokens.len()
            )));
        }
        device.htod_sync_copy_into(call.tokens, &mut staging.tokens.slice_mut(0..call.len()))?;
        device.htod_sync_copy_into(call.positions, &mut staging.positions.slice_mut(0..call.len()))?;

        // SAFETY: staging buffers hold `len` tokens/positions; the logits
        // buffer has at least one row.
        unsafe {
            sys::prefill(
                len,
                offset,
                *staging.tokens.device_ptr(),
                *staging.positions.device_ptr(),
                *logits.buffer.device_ptr(),
            );
        }
        self.sync()
    }

    fn decode(&mut self, call: DecodeCall<'_>, logits: &mut NativeLogits) -> Result<()> {
        let n = to_c_int(call.n_tokens, "decode tokens")?;
        let padded = to_c_int(call.padded_cache_len, "padded cache length")?;
        if call.n_tokens > logits.rows {
            return Err(Error::InvalidArgument(format!(
                "{} tokens but only {} logits rows",
                call.n_tokens, logits.rows
            )));
        }
        let device = Arc::clone(&self.device);
        let staging = self.staging()?;
        device.htod_sync_copy_into(call.tokens, &mut staging.tokens.slice_mut(0..call.n_tokens))?;
        device.htod_sync_copy_into(
            call.positions,
            &mut staging.positions.slice_mut(0..call.n_tokens),
        )?;
        device.htod_sync_copy_into(call.cache_lengths, &mut staging.cache_length)?;
        let mask_ptr = match call.mask {
            Some(mask) => {
                device.htod_sync_copy_into(mask.rows(), &mut staging.mask.slice_mut(0..mask.len()))?;
                *staging.mask.device_ptr()
            }
            None => 0,
        };

        // SAFETY: every pointer refers to a live staging or logits buffer sized
        // for `n` rows; a zero mask pointer means "no mask".
        unsafe {
            sys::decode(
                n,
                padded,
                *staging.tokens.device_ptr(),
                *staging.positions.device_ptr(),
                *staging.cache_length.device_ptr(),
                mask_ptr,
                *logits.buffer.device_ptr(),
                call.use_graph,
            );
        }
        self.sync()
    }

    fn logits_to_host(&self, logits: &NativeLogits, rows: usize) -> Result<HostLogits> {
        let len = rows.min(logits.rows) * logits.vocab_size;
        let bits = self.device.dtoh_sync_copy(&logits.buffer.slice(0..len))?;
        HostLogits::new(widen(&bits, logits.dtype)?, logits.vocab_size)
    }

    fn print_perf_summary(&self) {
        // SAFETY: diagnostics only; reads library-global counters.
        unsafe { sys::print_perf_summary() };
    }
}

/// Host address of a weight's bytes, as the library's loader expects.
fn host_ptr(tensor: &HostTensor) -> *const c_void {
    tensor.data.as_ptr().cast()
}

/// Decode raw f16/bf16 bit patterns to f32.
fn widen(bits: &[u16], dtype: DType) -> Result<Vec<f32>> {
    match dtype {
        DType::F16 => Ok(bits.iter().map(|&b| f16::from_bits(b).to_f32()).collect()),
        DType::BF16 => Ok(bits.iter().map(|&b| bf16::from_bits(b).to_f32()).collect()),
        other => Err(Error::UnsupportedDtype(format!("logits in {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_are_handed_over_from_host_memory() {
        let tensor = HostTensor::new(vec![2], DType::I32, vec![1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        assert_eq!(host_ptr(&tensor), tensor.data.as_ptr().cast::<c_void>());
    }

    #[test]
    fn widen_decodes_half_bits() {
        let bits: Vec<u16> = [1.5_f32, -2.0]
            .iter()
            .map(|&v| f16::from_f32(v).to_bits())
            .collect();
        assert_eq!(widen(&bits, DType::F16).unwrap(), vec![1.5, -2.0]);

        let bits: Vec<u16> = [0.25_f32].iter().map(|&v| bf16::from_f32(v).to_bits()).collect();
        assert_eq!(widen(&bits, DType::BF16).unwrap(), vec![0.25]);

        assert!(widen(&[0], DType::F32).is_err());
    }
}
