//! Tokenizer integration
//!
//! Defines the [`Tokenizer`] trait and the `tokenizers`-backed
//! [`HfTokenizer`].

mod hf_tokenizer;

use crate::Result;

pub use hf_tokenizer::HfTokenizer;

/// Converts between text and token ids.
///
/// Token ids are `i32`, matching what the compute engine consumes.
pub trait Tokenizer {
    /// Encode text to token ids.
    ///
    /// # Arguments
    /// * `text` - The text to encode
    /// * `add_bos` - Whether to prepend the beginning-of-sequence token
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<i32>>;

    /// Decode token ids to text, skipping special tokens.
    ///
    /// # Errors
    /// Returns an error if decoding fails.
    fn decode(&self, ids: &[i32]) -> Result<String>;

    /// End-of-sequence token id.
    fn eos_token_id(&self) -> i32;
}
