//! Token-level inference engine
//!
//! The [`Engine`] owns a [`ComputeEngine`], its storage capacity and the
//! single [`GenerationState`] reused by every decode step. It provides
//! chunked prefill, the padded decode step, and autoregressive generation
//! (tokens in, tokens out), either collected or streamed.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use marlin::backend::{pad_to_128, ComputeEngine, DecodeCall, LogitsBuffer, PrefillCall};
use marlin::weights::{CheckpointLoader, FusedSplit, LoadReport, WeightAliases};
use marlin::{
    AttentionMask, EngineOptions, Error, HostLogits, ModelConfig, ModelGeometry, Result, Sampler,
    Tokenizer,
};

use crate::scheduler::{generation_budget, plan_chunks};
use crate::state::GenerationState;
use crate::stream::TokenStream;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A terminator token was produced.
    Stop,
    /// The generation budget ran out.
    Length,
}

/// Prefill progress, reported to an optional callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefillEvent {
    Begin { total_tokens: usize },
    /// `current_tokens` prompt tokens are now in the cache.
    Advance { current_tokens: usize },
    Finish { total_time: Duration },
}

/// Shared callback receiving [`PrefillEvent`]s during generation.
///
/// Two handles compare equal when they share the same callback.
#[derive(Clone)]
pub struct PrefillProgress(Arc<dyn Fn(PrefillEvent) + Send + Sync>);

impl PrefillProgress {
    pub fn new(callback: impl Fn(PrefillEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    fn emit(&self, event: PrefillEvent) {
        (self.0)(event);
    }
}

impl fmt::Debug for PrefillProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrefillProgress(..)")
    }
}

impl PartialEq for PrefillProgress {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PrefillProgress {}

/// Options for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Maximum number of tokens to generate, including the one produced by
    /// prefill.
    pub max_new_tokens: usize,
    /// Generation stops right after any of these is produced.
    pub terminators: Vec<i32>,
    /// Receives prefill progress for the prompt.
    pub progress: Option<PrefillProgress>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            terminators: Vec::new(),
            progress: None,
        }
    }
}

/// Result of a non-streaming generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// Generated tokens (the prompt is not included). A terminator, if hit,
    /// is the last element.
    pub tokens: Vec<i32>,
    pub prefill_time: Duration,
    pub decode_time: Duration,
    pub finish_reason: FinishReason,
}

/// Progress of one generation through the shared stepping core.
#[derive(Debug)]
pub(crate) struct Decoding {
    /// Held until prefill consumes it.
    prompt: Vec<i32>,
    prompt_len: usize,
    budget: usize,
    produced: usize,
    last: i32,
    terminators: Vec<i32>,
    progress: Option<PrefillProgress>,
    finish: Option<FinishReason>,
}

impl Decoding {
    fn record(&mut self, token: i32) {
        self.produced += 1;
        self.last = token;
        if self.terminators.contains(&token) {
            self.finish = Some(FinishReason::Stop);
        } else if self.produced >= self.budget {
            self.finish = Some(FinishReason::Length);
        }
    }

    pub(crate) fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    /// True until the prefill step has run.
    pub(crate) fn awaiting_prefill(&self) -> bool {
        self.produced == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct DecodeLimits {
    max_total_length: usize,
    use_graph: bool,
}

struct DecodeInput<'a> {
    tokens: &'a [i32],
    positions: &'a [i32],
    cache_length: &'a mut [i32],
    mask: Option<&'a AttentionMask>,
}

/// Single-sequence orchestration over a compute engine.
pub struct Engine<E: ComputeEngine> {
    compute: E,
    config: ModelConfig,
    options: EngineOptions,
    geometry: ModelGeometry,
    max_total_length: usize,
    state: GenerationState<E::Logits>,
    sampler: Sampler,
    poisoned: bool,
}

impl<E: ComputeEngine> Engine<E> {
    /// Resolve geometry, initialise the model and its storage, and allocate
    /// the generation state.
    ///
    /// Weights are not loaded yet; call [`Engine::load_checkpoint`].
    ///
    /// # Errors
    /// Returns `Configuration` / `InvalidArgument` for unusable metadata or
    /// options (before any device call), or the device error from
    /// initialisation.
    pub fn new(mut compute: E, config: &ModelConfig, options: EngineOptions) -> Result<Self> {
        let geometry = ModelGeometry::resolve(config, &options)?;
        let sampler = Sampler::new(options.temperature, options.random_seed)?;

        compute.init_model(options.memory_limit, &geometry)?;
        let max_total_length = compute.init_storage()?;
        tracing::info!(
            max_total_length,
            memory_limit = options.memory_limit,
            "Initialized storage"
        );
        let logits = compute.alloc_logits(geometry.max_logit_rows, geometry.vocab_size, geometry.dtype)?;
        if logits.vocab_size() != geometry.vocab_size {
            return Err(Error::Device(format!(
                "logits buffer has vocab {} but the model has {}",
                logits.vocab_size(),
                geometry.vocab_size
            )));
        }

        Ok(Self {
            compute,
            config: config.clone(),
            options,
            geometry,
            max_total_length,
            state: GenerationState::new(logits),
            sampler,
            poisoned: false,
        })
    }

    /// Load every checkpoint tensor from `dir`, then the rotary
    /// frequencies for this engine's capacity.
    ///
    /// # Errors
    /// Returns `CheckpointResolution` without touching the engine when the
    /// directory is ambiguous; otherwise propagates read and device errors.
    pub fn load_checkpoint(&mut self, dir: impl AsRef<Path>) -> Result<LoadReport> {
        self.ensure_healthy()?;
        let mut loader =
            CheckpointLoader::new(self.geometry.dtype, WeightAliases::from_config(&self.config));
        if self.options.split_fused_projections {
            loader = loader.with_fused_split(FusedSplit::from_geometry(&self.geometry));
        }

        let result = loader.load(dir, &mut self.compute).and_then(|report| {
            loader.load_rotary(
                &self.config,
                self.geometry.head_dim,
                self.max_total_length,
                &mut self.compute,
            )?;
            Ok(report)
        });
        let report = poison_on_device_error(&mut self.poisoned, result)?;
        tracing::info!(
            files = report.files,
            tensors = report.tensors,
            handed_off = report.handed_off,
            "Loaded checkpoint"
        );
        Ok(report)
    }

    /// Largest total sequence length the storage can hold.
    #[must_use]
    pub fn max_total_length(&self) -> usize {
        self.max_total_length
    }

    #[must_use]
    pub fn geometry(&self) -> &ModelGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    #[must_use]
    pub fn compute(&self) -> &E {
        &self.compute
    }

    #[must_use]
    pub fn state(&self) -> &GenerationState<E::Logits> {
        &self.state
    }

    /// Whether an earlier device failure made the cache state unreliable.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn print_perf_summary(&self) {
        self.compute.print_perf_summary();
    }

    /// Run the prompt through the model in chunks and return the logits of
    /// its last position (one row).
    ///
    /// # Errors
    /// Returns `CapacityExceeded` (before any device call) when the prompt
    /// does not fit, `InvalidArgument` for empty or mismatched input, or
    /// the device error.
    pub fn prefill(
        &mut self,
        tokens: &[i32],
        positions: &[i32],
        mut progress: Option<&mut dyn FnMut(PrefillEvent)>,
    ) -> Result<HostLogits> {
        self.ensure_healthy()?;
        if tokens.is_empty() {
            return Err(Error::InvalidArgument("prefill needs at least one token".into()));
        }
        if positions.len() != tokens.len() {
            return Err(Error::InvalidArgument(format!(
                "{} tokens but {} positions",
                tokens.len(),
                positions.len()
            )));
        }
        if tokens.len() > self.max_total_length {
            return Err(Error::CapacityExceeded {
                requested: tokens.len(),
                max: self.max_total_length,
            });
        }

        let start = Instant::now();
        if let Some(cb) = progress.as_deref_mut() {
            cb(PrefillEvent::Begin {
                total_tokens: tokens.len(),
            });
        }
        for chunk in plan_chunks(tokens.len(), self.geometry.chunk_length) {
            let call = PrefillCall {
                tokens: &tokens[chunk.range()],
                positions: &positions[chunk.range()],
                offset: chunk.offset,
            };
            let result = self.compute.prefill(call, &mut self.state.logits);
            poison_on_device_error(&mut self.poisoned, result)?;
            if let Some(cb) = progress.as_deref_mut() {
                cb(PrefillEvent::Advance {
                    current_tokens: chunk.end(),
                });
            }
        }
        if let Some(cb) = progress.as_deref_mut() {
            cb(PrefillEvent::Finish {
                total_time: start.elapsed(),
            });
        }

        let result = self.compute.logits_to_host(&self.state.logits, 1);
        poison_on_device_error(&mut self.poisoned, result)
    }

    /// One decode step for `tokens.len()` new tokens.
    ///
    /// `cache_length[0]` is raised by the token count for the device call
    /// (the padded length is that value rounded up to a multiple of 128)
    /// and restored before returning, even on failure. Returns one logits
    /// row per submitted token.
    ///
    /// # Errors
    /// Returns `CapacityExceeded` or `InvalidArgument` before any device
    /// call when the step cannot be issued, or the device error.
    pub fn decode(
        &mut self,
        tokens: &[i32],
        positions: &[i32],
        cache_length: &mut [i32],
        mask: Option<&AttentionMask>,
    ) -> Result<HostLogits> {
        self.ensure_healthy()?;
        let limits = self.limits();
        decode_step(
            &mut self.compute,
            &mut self.state.logits,
            &mut self.poisoned,
            limits,
            DecodeInput {
                tokens,
                positions,
                cache_length,
                mask,
            },
        )
    }

    /// Generate up to `options.max_new_tokens` tokens after `input`.
    ///
    /// # Errors
    /// Propagates prefill, decode and sampling errors.
    pub fn generate(&mut self, input: &[i32], options: &GenerateOptions) -> Result<Generation> {
        let mut run = self.begin(input, options)?;
        let mut tokens = Vec::with_capacity(run.budget);

        let prefill_start = Instant::now();
        if !run.is_finished() {
            tokens.push(self.next_token(&mut run)?);
        }
        let prefill_time = prefill_start.elapsed();

        let decode_start = Instant::now();
        while !run.is_finished() {
            tokens.push(self.next_token(&mut run)?);
        }
        let decode_time = decode_start.elapsed();

        Ok(Generation {
            tokens,
            prefill_time,
            decode_time,
            finish_reason: run.finish_reason().unwrap_or(FinishReason::Length),
        })
    }

    /// Like [`Engine::generate`], but returns a lazy stream that runs one
    /// step per pulled event. Dropping the stream cancels generation.
    ///
    /// # Errors
    /// Returns input validation errors immediately; device errors surface
    /// as stream items.
    pub fn generate_stream<'a, T: Tokenizer>(
        &'a mut self,
        input: &[i32],
        options: &GenerateOptions,
        tokenizer: &'a T,
    ) -> Result<TokenStream<'a, E, T>> {
        let run = self.begin(input, options)?;
        Ok(TokenStream::new(self, run, tokenizer))
    }

    /// Validate a prompt and set up a generation run.
    pub(crate) fn begin(&mut self, input: &[i32], options: &GenerateOptions) -> Result<Decoding> {
        self.ensure_healthy()?;
        if input.is_empty() {
            return Err(Error::InvalidArgument("generation needs a non-empty prompt".into()));
        }
        if input.len() > self.max_total_length {
            return Err(Error::CapacityExceeded {
                requested: input.len(),
                max: self.max_total_length,
            });
        }
        let budget = generation_budget(input.len(), options.max_new_tokens, self.max_total_length);
        if budget < options.max_new_tokens {
            tracing::warn!(
                requested = options.max_new_tokens,
                budget,
                max_total_length = self.max_total_length,
                "Generation length clamped to storage capacity"
            );
        }
        Ok(Decoding {
            prompt: input.to_vec(),
            prompt_len: input.len(),
            budget,
            produced: 0,
            last: 0,
            terminators: options.terminators.clone(),
            progress: options.progress.clone(),
            finish: (budget == 0).then_some(FinishReason::Length),
        })
    }

    /// Produce the next token of `run`: prefill for the first, one decode
    /// step for each later one.
    pub(crate) fn next_token(&mut self, run: &mut Decoding) -> Result<i32> {
        if run.is_finished() {
            return Err(Error::InvalidArgument("generation already finished".into()));
        }
        let logits = if run.awaiting_prefill() {
            let positions = (0..run.prompt.len())
                .map(to_i32)
                .collect::<Result<Vec<i32>>>()?;
            let prompt = std::mem::take(&mut run.prompt);
            match run.progress.clone() {
                Some(progress) => {
                    let mut emit = |event: PrefillEvent| progress.emit(event);
                    self.prefill(&prompt, &positions, Some(&mut emit))?
                }
                None => self.prefill(&prompt, &positions, None)?,
            }
        } else {
            self.ensure_healthy()?;
            let position = to_i32(run.prompt_len + run.produced - 1)?;
            self.state.set_step(run.last, position);

            let limits = self.limits();
            let GenerationState {
                input_ids,
                position_ids,
                cache_length,
                logits,
            } = &mut self.state;
            decode_step(
                &mut self.compute,
                logits,
                &mut self.poisoned,
                limits,
                DecodeInput {
                    tokens: &input_ids[..],
                    positions: &position_ids[..],
                    cache_length: &mut cache_length[..],
                    mask: None,
                },
            )?
        };
        let token = self.sampler.sample(logits.row(0)?)?;
        run.record(token);
        Ok(token)
    }

    fn limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_total_length: self.max_total_length,
            use_graph: self.options.cuda_graph,
        }
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.poisoned {
            Err(Error::Device(
                "engine is unusable after an earlier device failure; rebuild it".into(),
            ))
        } else {
            Ok(())
        }
    }
}

fn decode_step<E: ComputeEngine>(
    compute: &mut E,
    logits: &mut E::Logits,
    poisoned: &mut bool,
    limits: DecodeLimits,
    mut input: DecodeInput<'_>,
) -> Result<HostLogits> {
    let n = input.tokens.len();
    if n == 0 {
        return Err(Error::InvalidArgument("decode needs at least one token".into()));
    }
    if n > logits.rows() {
        return Err(Error::InvalidArgument(format!(
            "decode of {n} tokens exceeds the {} logits rows",
            logits.rows()
        )));
    }
    if input.positions.len() != n {
        return Err(Error::InvalidArgument(format!(
            "{n} tokens but {} positions",
            input.positions.len()
        )));
    }
    if input.cache_length.len() != 1 {
        return Err(Error::InvalidArgument(format!(
            "expected one cache length, got {}",
            input.cache_length.len()
        )));
    }
    if let Some(mask) = input.mask {
        if mask.len() != n {
            return Err(Error::InvalidArgument(format!(
                "attention mask has {} rows for {n} tokens",
                mask.len()
            )));
        }
    }
    let cached = usize::try_from(input.cache_length[0]).map_err(|_| {
        Error::InvalidArgument(format!("negative cache length {}", input.cache_length[0]))
    })?;
    let requested = cached + n;
    if requested > limits.max_total_length {
        return Err(Error::CapacityExceeded {
            requested,
            max: limits.max_total_length,
        });
    }
    let step = to_i32(n)?;

    input.cache_length[0] += step;
    let call = DecodeCall {
        n_tokens: n,
        padded_cache_len: pad_to_128(requested),
        tokens: input.tokens,
        positions: input.positions,
        cache_lengths: &*input.cache_length,
        mask: input.mask,
        use_graph: limits.use_graph,
    };
    let result = compute.decode(call, logits);
    input.cache_length[0] -= step;

    let result = result.and_then(|()| compute.logits_to_host(logits, n));
    poison_on_device_error(poisoned, result)
}

fn poison_on_device_error<T>(poisoned: &mut bool, result: Result<T>) -> Result<T> {
    if let Err(Error::Device(msg)) = &result {
        tracing::error!(error = %msg, "Device failure; engine poisoned");
        *poisoned = true;
    }
    result
}

fn to_i32(value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("{value} does not fit in an i32 index")))
}
