//! Text-level inference runtime
//!
//! The [`Runtime`] wraps an [`Engine`] and a [`Tokenizer`], providing
//! a text-in, text-out interface for generation.

use std::path::Path;

use marlin::weights::LoadReport;
use marlin::{ComputeEngine, Result, Tokenizer};

use crate::engine::{GenerateOptions, Generation};
use crate::stream::TokenStream;
use crate::Engine;

/// Generated text together with the token-level result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub generation: Generation,
}

/// Text-level inference runtime.
pub struct Runtime<E: ComputeEngine, T: Tokenizer> {
    engine: Engine<E>,
    tokenizer: T,
}

impl<E: ComputeEngine, T: Tokenizer> Runtime<E, T> {
    #[must_use]
    pub fn new(engine: Engine<E>, tokenizer: T) -> Self {
        Self { engine, tokenizer }
    }

    /// Load weights into the underlying engine.
    ///
    /// # Errors
    /// See [`Engine::load_checkpoint`].
    pub fn load_checkpoint(&mut self, dir: impl AsRef<Path>) -> Result<LoadReport> {
        self.engine.load_checkpoint(dir)
    }

    #[must_use]
    pub fn engine(&self) -> &Engine<E> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<E> {
        &mut self.engine
    }

    #[must_use]
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Options generating up to `max_new_tokens`, stopping at the model's
    /// declared EOS ids and the tokenizer's EOS.
    #[must_use]
    pub fn options(&self, max_new_tokens: usize) -> GenerateOptions {
        let mut terminators = self.engine.model_config().eos_token_ids();
        let eos = self.tokenizer.eos_token_id();
        if !terminators.contains(&eos) {
            terminators.push(eos);
        }
        GenerateOptions {
            max_new_tokens,
            terminators,
            progress: None,
        }
    }

    /// Generate a completion for `prompt`, blocking until done.
    ///
    /// # Errors
    /// Returns an error if tokenization or generation fails.
    pub fn generate(&mut self, prompt: &str, options: &GenerateOptions) -> Result<Completion> {
        let input_ids = self.tokenizer.encode(prompt, true)?;
        let generation = self.engine.generate(&input_ids, options)?;
        let text = self.tokenizer.decode(&generation.tokens)?;
        Ok(Completion { text, generation })
    }

    /// Stream a completion for `prompt`.
    ///
    /// # Errors
    /// Returns an error if tokenization or input validation fails.
    pub fn generate_stream(
        &mut self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<TokenStream<'_, E, T>> {
        let input_ids = self.tokenizer.encode(prompt, true)?;
        self.engine
            .generate_stream(&input_ids, options, &self.tokenizer)
    }
}
