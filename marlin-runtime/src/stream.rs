//! Streaming generation and incremental detokenization.
//!
//! [`TokenStream`] is a pull-driven iterator: every `next()` runs exactly
//! one step (prefill for the first event, one decode step afterwards).
//! Dropping it cancels generation.

#![allow(clippy::module_name_repetitions)]

use std::time::{Duration, Instant};

use marlin::{ComputeEngine, Result, Tokenizer};

use crate::engine::{Decoding, Engine, FinishReason};

/// Turns generated tokens into text fragments one at a time.
///
/// Decoding tokens in isolation loses the spacing and merge rules of most
/// subword vocabularies. Each fragment is therefore the text of the window
/// `[previous, current]` minus the text of `[previous]` alone; the first
/// token is decoded by itself.
pub struct StreamAssembler<'t, T: Tokenizer> {
    tokenizer: &'t T,
    previous: Option<i32>,
}

impl<'t, T: Tokenizer> StreamAssembler<'t, T> {
    #[must_use]
    pub fn new(tokenizer: &'t T) -> Self {
        Self {
            tokenizer,
            previous: None,
        }
    }

    /// Text contributed by `token`.
    ///
    /// # Errors
    /// Propagates tokenizer errors.
    pub fn push(&mut self, token: i32) -> Result<String> {
        let fragment = match self.previous {
            None => self.tokenizer.decode(&[token])?,
            Some(previous) => {
                let window = self.tokenizer.decode(&[previous, token])?;
                let solo = self.tokenizer.decode(&[previous])?;
                match window.strip_prefix(solo.as_str()) {
                    Some(rest) => rest.to_owned(),
                    None => window.chars().skip(solo.chars().count()).collect(),
                }
            }
        };
        self.previous = Some(token);
        Ok(fragment)
    }
}

/// One streamed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub token: i32,
    /// Text contributed by this token.
    pub text: String,
    /// Last event of the stream.
    pub is_finished: bool,
    /// Set on the first event only.
    pub prefill_time: Option<Duration>,
    /// Time since the decode phase started (zero for the first event).
    pub decode_time: Duration,
    /// Why the stream ended; set on the last event.
    pub finish_reason: Option<FinishReason>,
}

/// Lazy generation, one [`StreamEvent`] per pulled item.
pub struct TokenStream<'a, E: ComputeEngine, T: Tokenizer> {
    engine: &'a mut Engine<E>,
    run: Decoding,
    assembler: StreamAssembler<'a, T>,
    decode_start: Option<Instant>,
    done: bool,
}

impl<'a, E: ComputeEngine, T: Tokenizer> TokenStream<'a, E, T> {
    pub(crate) fn new(engine: &'a mut Engine<E>, run: Decoding, tokenizer: &'a T) -> Self {
        let done = run.is_finished();
        Self {
            engine,
            run,
            assembler: StreamAssembler::new(tokenizer),
            decode_start: None,
            done,
        }
    }

    fn step(&mut self) -> Result<StreamEvent> {
        let (token, prefill_time, decode_time) = if self.run.awaiting_prefill() {
            let start = Instant::now();
            let token = self.engine.next_token(&mut self.run)?;
            (token, Some(start.elapsed()), Duration::ZERO)
        } else {
            let start = *self.decode_start.get_or_insert_with(Instant::now);
            let token = self.engine.next_token(&mut self.run)?;
            (token, None, start.elapsed())
        };
        let text = self.assembler.push(token)?;
        Ok(StreamEvent {
            token,
            text,
            is_finished: self.run.is_finished(),
            prefill_time,
            decode_time,
            finish_reason: self.run.finish_reason(),
        })
    }
}

impl<E: ComputeEngine, T: Tokenizer> Iterator for TokenStream<'_, E, T> {
    type Item = Result<StreamEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let event = self.step();
        match &event {
            Ok(ev) => self.done = ev.is_finished,
            Err(_) => self.done = true,
        }
        Some(event)
    }
}
