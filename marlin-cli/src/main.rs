//! Text generation with a W4A16 GPTQ-Marlin checkpoint
//!
//! Usage:
//!   CPMCU_LIB_DIR=/opt/cpmcu/lib cargo run -p marlin-cli --features native -- -m /path/to/model "Hello"
//!   # Stream tokens as they are produced, sampling at temperature 0.7:
//!   cargo run -p marlin-cli --features native -- -m /path/to/model --stream -t 0.7 "Hello"
//!   # Block-sparse attention for long prompts:
//!   cargo run -p marlin-cli --features native -- -m /path/to/model --sparse "..."

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use marlin::{DType, EngineOptions, HfTokenizer, ModelConfig, Result, SparseAttentionOptions};
use marlin_cuda::NativeEngine;
use marlin_runtime::{Engine, GenerateOptions, PrefillEvent, PrefillProgress, Runtime};

/// Generate text from a quantized checkpoint directory.
///
/// The directory must hold `config.json`, `tokenizer.json` and the weights
/// (safetensors shards, a consolidated Marlin file, or pickle shards).
#[derive(Parser)]
#[command(name = "generate")]
struct Cli {
    /// Path to the model directory
    #[arg(short, long, env = "MARLIN_MODEL_PATH")]
    model: PathBuf,

    /// Text prompt
    #[arg(default_value = "Hello")]
    prompt: String,

    /// Maximum tokens to generate
    #[arg(short = 'n', long, default_value_t = 100)]
    max_tokens: usize,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long, default_value_t = 0.0)]
    temperature: f32,

    /// RNG seed for sampling
    #[arg(short, long)]
    seed: Option<u64>,

    /// Maximum tokens per prefill call
    #[arg(long, default_value_t = 1024)]
    chunk_length: usize,

    /// Fraction of device memory the engine may use
    #[arg(long, default_value_t = 0.8)]
    memory_limit: f32,

    /// Activation dtype override (float16 or bfloat16)
    #[arg(long, value_parser = parse_dtype)]
    dtype: Option<DType>,

    /// Replay a captured graph for decode steps
    #[arg(long)]
    cuda_graph: bool,

    /// Enable block-sparse attention
    #[arg(long)]
    sparse: bool,

    #[arg(long, default_value_t = 1, requires = "sparse")]
    sink_window_size: usize,

    #[arg(long, default_value_t = 32, requires = "sparse")]
    block_window_size: usize,

    #[arg(long, default_value_t = 32, requires = "sparse")]
    sparse_topk: usize,

    #[arg(long, default_value_t = 8192, requires = "sparse")]
    sparse_switch: usize,

    /// Score sparse blocks with compressed log-sum-exp
    #[arg(long, requires = "sparse")]
    use_compress_lse: bool,

    /// Per-head QK normalisation (dense attention only)
    #[arg(long, conflicts_with = "sparse")]
    qk_norm: bool,

    /// QKV projection bias (dense attention only)
    #[arg(long, conflicts_with = "sparse")]
    attn_bias: bool,

    /// Print tokens as they are generated
    #[arg(long)]
    stream: bool,

    /// Print the engine's kernel timing summary at exit
    #[arg(long)]
    perf_summary: bool,
}

fn parse_dtype(s: &str) -> std::result::Result<DType, String> {
    match DType::from_torch_name(s) {
        Some(dtype) if dtype.is_engine_float() => Ok(dtype),
        _ => Err(format!("expected float16 or bfloat16, got {s:?}")),
    }
}

impl Cli {
    fn engine_options(&self) -> EngineOptions {
        let sparse = self.sparse.then(|| SparseAttentionOptions {
            sink_window_size: self.sink_window_size,
            block_window_size: self.block_window_size,
            topk: self.sparse_topk,
            switch_threshold: self.sparse_switch,
            use_compress_lse: self.use_compress_lse,
        });
        EngineOptions {
            memory_limit: self.memory_limit,
            chunk_length: self.chunk_length,
            dtype: self.dtype,
            cuda_graph: self.cuda_graph,
            sparse,
            use_qk_norm: self.qk_norm,
            use_attn_bias: self.attn_bias,
            temperature: self.temperature,
            random_seed: self.seed,
            ..EngineOptions::default()
        }
    }
}

fn log_prefill(event: PrefillEvent) {
    match event {
        PrefillEvent::Begin { total_tokens } => tracing::info!(total_tokens, "Prefill started"),
        PrefillEvent::Advance { current_tokens } => tracing::info!(current_tokens, "Prefill"),
        PrefillEvent::Finish { total_time } => {
            tracing::info!(secs = total_time.as_secs_f64(), "Prefill finished");
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    tracing::info!(model = %cli.model.display(), "Loading model");
    let config = ModelConfig::from_dir(&cli.model)?;
    let tokenizer = HfTokenizer::from_pretrained(&cli.model)?;

    let load_start = Instant::now();
    let compute = NativeEngine::new(0)?;
    let engine = Engine::new(compute, &config, cli.engine_options())?;
    let mut runtime = Runtime::new(engine, tokenizer);
    let report = runtime.load_checkpoint(&cli.model)?;
    let geometry = runtime.engine().geometry();
    println!(
        "Model loaded ({} layers, {} hidden, vocab {}, {} weights) in {:.2}s; max length {}",
        geometry.num_layers,
        geometry.hidden_size,
        geometry.vocab_size,
        report.handed_off,
        load_start.elapsed().as_secs_f64(),
        runtime.engine().max_total_length(),
    );

    let options = GenerateOptions {
        progress: Some(PrefillProgress::new(log_prefill)),
        ..runtime.options(cli.max_tokens)
    };
    print!("{}", cli.prompt);
    io::stdout().flush()?;

    let (generated, prefill_time, decode_time) = if cli.stream {
        let mut generated = 0;
        let mut prefill_time = None;
        let mut decode_time = std::time::Duration::ZERO;
        for event in runtime.generate_stream(&cli.prompt, &options)? {
            let event = event?;
            print!("{}", event.text);
            io::stdout().flush()?;
            generated += 1;
            prefill_time = prefill_time.or(event.prefill_time);
            decode_time = event.decode_time;
        }
        (generated, prefill_time.unwrap_or_default(), decode_time)
    } else {
        let completion = runtime.generate(&cli.prompt, &options)?;
        print!("{}", completion.text);
        let generation = completion.generation;
        (
            generation.tokens.len(),
            generation.prefill_time,
            generation.decode_time,
        )
    };

    println!();
    let decode_secs = decode_time.as_secs_f64();
    println!(
        "Generated {generated} tokens: prefill {:.2}s, decode {decode_secs:.2}s ({:.1} tokens/sec)",
        prefill_time.as_secs_f64(),
        if decode_secs > 0.0 {
            generated.saturating_sub(1) as f64 / decode_secs
        } else {
            0.0
        },
    );

    if cli.perf_summary {
        runtime.engine().print_perf_summary();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_lse_flag_reaches_sparse_options() {
        let cli = Cli::try_parse_from(["generate", "-m", "model", "--sparse", "--use-compress-lse"])
            .unwrap();
        let sparse = cli.engine_options().sparse.unwrap();
        assert!(sparse.use_compress_lse);

        let cli = Cli::try_parse_from(["generate", "-m", "model", "--sparse"]).unwrap();
        assert!(!cli.engine_options().sparse.unwrap().use_compress_lse);
    }

    #[test]
    fn compress_lse_requires_sparse() {
        assert!(Cli::try_parse_from(["generate", "-m", "model", "--use-compress-lse"]).is_err());
    }
}
