//! Raw C ABI of the GPTQ-Marlin kernel library.
//!
//! Step-input and logits pointers are device addresses. Weight data is
//! passed as a host pointer and copied by the library. The library keeps its
//! model and key/value cache in process-global state, so at most one model
//! can be initialised per process.

#![allow(clippy::too_many_arguments)]

use std::os::raw::{c_char, c_int, c_void};

use cudarc::driver::sys::CUdeviceptr;

extern "C" {
    /// Initialise a model with block-sparse attention.
    pub fn init_w4a16_gptq_marlin_minicpm4_model(
        memory_limit: f32,
        vocab_size: c_int,
        num_hidden_layers: c_int,
        hidden_size: c_int,
        intermediate_size: c_int,
        num_attention_heads: c_int,
        num_key_value_heads: c_int,
        head_dim: c_int,
        rms_norm_eps: f32,
        group_size: c_int,
        torch_dtype: c_int,
        chunk_length: c_int,
        scale_embed: f32,
        scale_lmhead: f32,
        scale_residual: f32,
        sink_window_size: c_int,
        block_window_size: c_int,
        sparse_topk_k: c_int,
        sparse_switch: c_int,
        use_compress_lse: bool,
    );

    /// Initialise a model with dense attention.
    pub fn init_w4a16_gptq_marlin_base_model(
        memory_limit: f32,
        vocab_size: c_int,
        num_hidden_layers: c_int,
        hidden_size: c_int,
        intermediate_size: c_int,
        num_attention_heads: c_int,
        num_key_value_heads: c_int,
        head_dim: c_int,
        rms_norm_eps: f32,
        group_size: c_int,
        torch_dtype: c_int,
        chunk_length: c_int,
        scale_embed: f32,
        scale_lmhead: f32,
        scale_residual: f32,
        use_qk_norm: bool,
        use_attn_bias: bool,
    );

    /// Allocate the key/value cache; returns the maximum total sequence length.
    pub fn init_storage() -> c_int;

    /// Copy one named weight from host memory into the model.
    pub fn load_model(name: *const c_char, data: *const c_void);

    pub fn prefill(
        input_length: c_int,
        history_length: c_int,
        input: CUdeviceptr,
        position_ids: CUdeviceptr,
        output: CUdeviceptr,
    );

    /// `mask_2d` is 0 when no mask is supplied.
    pub fn decode(
        input_length: c_int,
        padded_length: c_int,
        input: CUdeviceptr,
        position_ids: CUdeviceptr,
        cache_length: CUdeviceptr,
        mask_2d: CUdeviceptr,
        output: CUdeviceptr,
        cuda_graph: bool,
    );

    pub fn print_perf_summary();
}
