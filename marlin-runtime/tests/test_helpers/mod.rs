//! Shared helpers for engine integration tests.
//!
//! Provides a recording [`MockEngine`] that stands in for the native
//! compute engine, plus a toy tokenizer.

#![allow(dead_code, clippy::cast_precision_loss, clippy::cast_possible_wrap)]

use std::collections::HashMap;

use marlin::backend::{ComputeEngine, DecodeCall, LogitsBuffer, PrefillCall};
use marlin::{
    DType, EngineOptions, Error, HostLogits, HostTensor, ModelConfig, ModelGeometry, Result,
    Tokenizer, WeightSink,
};
use marlin_runtime::Engine;

pub const VOCAB: usize = 32;

/// A device call observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    InitModel { memory_limit: f32 },
    InitStorage,
    AllocLogits { rows: usize, vocab_size: usize },
    Prefill { offset: usize, len: usize, last_token: i32 },
    Decode {
        n_tokens: usize,
        padded_cache_len: usize,
        token: i32,
        position: i32,
        cache_length: i32,
        use_graph: bool,
        masked: bool,
    },
    LoadWeight { name: String, dtype: DType, shape: Vec<usize> },
}

pub struct MockLogits {
    rows: usize,
    data: Vec<f32>,
}

impl LogitsBuffer for MockLogits {
    fn rows(&self) -> usize {
        self.rows
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }
}

/// Records every call; its "model" maps the last input token to the next
/// token through `next`.
pub struct MockEngine {
    pub calls: Vec<Call>,
    pub geometry: Option<ModelGeometry>,
    max_total_length: usize,
    next: Box<dyn Fn(i32) -> i32>,
    fail_decode_at: Option<usize>,
    logits_rows: Option<usize>,
    decodes: usize,
}

impl MockEngine {
    /// Counting model: token `t` is followed by `t + 1`.
    pub fn new(max_total_length: usize) -> Self {
        Self::with_model(max_total_length, |t| (t + 1) % VOCAB as i32)
    }

    pub fn with_model(max_total_length: usize, next: impl Fn(i32) -> i32 + 'static) -> Self {
        Self {
            calls: Vec::new(),
            geometry: None,
            max_total_length,
            next: Box::new(next),
            fail_decode_at: None,
            logits_rows: None,
            decodes: 0,
        }
    }

    /// Make the `index`-th decode call (0-based) fail with a device error.
    pub fn failing_decode_at(mut self, index: usize) -> Self {
        self.fail_decode_at = Some(index);
        self
    }

    /// Allocate `rows` logits rows regardless of what the engine asks for.
    pub fn with_logits_rows(mut self, rows: usize) -> Self {
        self.logits_rows = Some(rows);
        self
    }

    pub fn prefills(&self) -> Vec<(usize, usize)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Prefill { offset, len, .. } => Some((*offset, *len)),
                _ => None,
            })
            .collect()
    }

    pub fn decodes(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Decode { .. }))
            .collect()
    }

    pub fn loaded(&self) -> Vec<(&str, DType)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::LoadWeight { name, dtype, .. } => Some((name.as_str(), *dtype)),
                _ => None,
            })
            .collect()
    }

    /// Device calls issued after initialisation.
    pub fn step_calls(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Prefill { .. } | Call::Decode { .. }))
            .count()
    }

    /// Peaked but not one-hot, so temperature sampling has real choices.
    fn write_row(&self, logits: &mut MockLogits, row: usize, input: i32) {
        let target = (self.next)(input) as usize % VOCAB;
        let out = &mut logits.data[row * VOCAB..(row + 1) * VOCAB];
        for (j, v) in out.iter_mut().enumerate() {
            *v = ((input as usize * 31 + j * 17) % 13) as f32 * 0.1;
        }
        out[target] = 3.0;
    }
}

impl WeightSink for MockEngine {
    fn load_weight(&mut self, name: &str, tensor: HostTensor) -> Result<()> {
        self.calls.push(Call::LoadWeight {
            name: name.to_owned(),
            dtype: tensor.dtype,
            shape: tensor.shape,
        });
        Ok(())
    }
}

impl ComputeEngine for MockEngine {
    type Logits = MockLogits;

    fn init_model(&mut self, memory_limit: f32, geometry: &ModelGeometry) -> Result<()> {
        self.geometry = Some(geometry.clone());
        self.calls.push(Call::InitModel { memory_limit });
        Ok(())
    }

    fn init_storage(&mut self) -> Result<usize> {
        self.calls.push(Call::InitStorage);
        Ok(self.max_total_length)
    }

    fn alloc_logits(&mut self, rows: usize, vocab_size: usize, _dtype: DType) -> Result<MockLogits> {
        self.calls.push(Call::AllocLogits { rows, vocab_size });
        let rows = self.logits_rows.unwrap_or(rows);
        Ok(MockLogits {
            rows,
            data: vec![0.0; rows * vocab_size],
        })
    }

    fn prefill(&mut self, call: PrefillCall<'_>, logits: &mut MockLogits) -> Result<()> {
        let last_token = *call.tokens.last().ok_or_else(|| Error::Device("empty chunk".into()))?;
        self.calls.push(Call::Prefill {
            offset: call.offset,
            len: call.len(),
            last_token,
        });
        self.write_row(logits, 0, last_token);
        Ok(())
    }

    fn decode(&mut self, call: DecodeCall<'_>, logits: &mut MockLogits) -> Result<()> {
        self.calls.push(Call::Decode {
            n_tokens: call.n_tokens,
            padded_cache_len: call.padded_cache_len,
            token: call.tokens[0],
            position: call.positions[0],
            cache_length: call.cache_lengths[0],
            use_graph: call.use_graph,
            masked: call.mask.is_some(),
        });
        let index = self.decodes;
        self.decodes += 1;
        if self.fail_decode_at == Some(index) {
            return Err(Error::Device("injected decode failure".into()));
        }
        for (row, &token) in call.tokens.iter().enumerate() {
            self.write_row(logits, row, token);
        }
        Ok(())
    }

    fn logits_to_host(&self, logits: &MockLogits, rows: usize) -> Result<HostLogits> {
        HostLogits::new(logits.data[..rows * VOCAB].to_vec(), VOCAB)
    }
}

pub const CONFIG_JSON: &str = r#"{
    "vocab_size": 32,
    "hidden_size": 64,
    "intermediate_size": 128,
    "num_hidden_layers": 2,
    "num_attention_heads": 4,
    "num_key_value_heads": 2,
    "torch_dtype": "float16",
    "tie_word_embeddings": false,
    "quantization_config": {"bits": 4, "group_size": 128, "quant_method": "gptq"}
}"#;

pub fn config() -> ModelConfig {
    serde_json::from_str(CONFIG_JSON).unwrap()
}

pub fn tied_config() -> ModelConfig {
    let mut config = config();
    config.tie_word_embeddings = true;
    config
}

pub fn options(chunk_length: usize) -> EngineOptions {
    EngineOptions {
        chunk_length,
        ..EngineOptions::default()
    }
}

pub fn engine(max_total_length: usize, chunk_length: usize) -> Engine<MockEngine> {
    Engine::new(MockEngine::new(max_total_length), &config(), options(chunk_length)).unwrap()
}

pub fn sampled_engine(seed: u64) -> Engine<MockEngine> {
    let options = EngineOptions {
        temperature: 0.8,
        random_seed: Some(seed),
        ..EngineOptions::default()
    };
    Engine::new(MockEngine::new(4096), &config(), options).unwrap()
}

/// Prompt `0, 1, ..., n-1` (mod vocab).
pub fn prompt(n: usize) -> Vec<i32> {
    (0..n).map(|i| (i % VOCAB) as i32).collect()
}

/// Every id decodes to `<id>`; id 0 is special and decodes to nothing.
pub struct ToyTokenizer {
    words: HashMap<String, i32>,
}

impl ToyTokenizer {
    pub fn new() -> Self {
        let words = (1..VOCAB as i32).map(|i| (format!("w{i}"), i)).collect();
        Self { words }
    }
}

impl Tokenizer for ToyTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<i32>> {
        let mut ids = Vec::new();
        if add_bos {
            ids.push(1);
        }
        for word in text.split_whitespace() {
            let id = self
                .words
                .get(word)
                .copied()
                .ok_or_else(|| Error::Tokenizer(format!("unknown word {word}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[i32]) -> Result<String> {
        Ok(ids
            .iter()
            .filter(|&&id| id != 0)
            .map(|id| format!("w{id}"))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn eos_token_id(&self) -> i32 {
        0
    }
}
