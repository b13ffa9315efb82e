//! Next-token selection from a logits row.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::logits::argmax;
use crate::{Error, Result};

/// Greedy or temperature sampler with its own generator.
///
/// Temperature `0` is arg-max and never touches the generator. Any positive
/// temperature draws from `softmax(logits / temperature)`.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    rng: StdRng,
}

impl Sampler {
    /// Build a sampler. `seed = None` seeds from OS entropy.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a negative or non-finite temperature.
    pub fn new(temperature: f32, seed: Option<u64>) -> Result<Self> {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "temperature must be a finite value >= 0, got {temperature}"
            )));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { temperature, rng })
    }

    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Pick a token id from one logits row.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty row or one with no finite
    /// probability mass.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn sample(&mut self, logits: &[f32]) -> Result<i32> {
        let index = if self.is_greedy() {
            argmax(logits)?
        } else {
            let probs = softmax(logits, self.temperature);
            let dist = WeightedIndex::new(&probs).map_err(|e| {
                Error::InvalidArgument(format!("cannot sample from logits: {e}"))
            })?;
            dist.sample(&mut self.rng)
        };
        Ok(index as i32)
    }
}

fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits
        .iter()
        .map(|l| l / temperature)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|l| {
            let p = (l / temperature - max).exp();
            if p.is_finite() {
                p
            } else {
                0.0
            }
        })
        .collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in &mut probs {
            *p /= sum;
        }
    }
    probs
}
