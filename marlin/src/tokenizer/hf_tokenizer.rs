//! Hugging Face `tokenizer.json` support via the `tokenizers` crate

use std::path::Path;

use super::Tokenizer;
use crate::{Error, Result};

/// Wrapper around a `tokenizers::Tokenizer`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    bos_token_id: i32,
    eos_token_id: i32,
}

impl HfTokenizer {
    /// Load `tokenizer.json` from a model directory.
    ///
    /// # Errors
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn from_pretrained(model_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let tokenizer_path = model_path.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(Error::Tokenizer(format!(
                "No tokenizer.json found in {}",
                model_path.display()
            )));
        }
        Self::from_file(&tokenizer_path)
    }

    /// Load a tokenizer file directly.
    ///
    /// # Errors
    /// Returns an error if the file cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self::new(inner))
    }

    /// Wrap an already-built tokenizer.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        let bos_token_id = inner
            .token_to_id("<|begin_of_text|>")
            .or_else(|| inner.token_to_id("<s>"))
            .unwrap_or(1) as i32;
        let eos_token_id = inner
            .token_to_id("<|end_of_text|>")
            .or_else(|| inner.token_to_id("<|im_end|>"))
            .or_else(|| inner.token_to_id("</s>"))
            .unwrap_or(2) as i32;
        Self {
            inner,
            bos_token_id,
            eos_token_id,
        }
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<i32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if add_bos {
            ids.push(self.bos_token_id);
        }
        for &id in encoding.get_ids() {
            ids.push(i32::try_from(id).map_err(|_| {
                Error::Tokenizer(format!("token id {id} does not fit in i32"))
            })?);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[i32]) -> Result<String> {
        let ids = ids
            .iter()
            .map(|&id| {
                u32::try_from(id).map_err(|_| Error::Tokenizer(format!("negative token id {id}")))
            })
            .collect::<Result<Vec<u32>>>()?;
        self.inner
            .decode(&ids, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn eos_token_id(&self) -> i32 {
        self.eos_token_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4},
            "unk_token": "[UNK]"
        }
    }"#;

    fn tokenizer() -> HfTokenizer {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL).unwrap();
        HfTokenizer::from_pretrained(dir.path()).unwrap()
    }

    #[test]
    fn encodes_with_and_without_bos() {
        let tok = tokenizer();
        assert_eq!(tok.encode("hello world", false).unwrap(), vec![3, 4]);
        assert_eq!(tok.encode("hello world", true).unwrap(), vec![1, 3, 4]);
    }

    #[test]
    fn special_ids_are_discovered() {
        let tok = tokenizer();
        assert_eq!(tok.encode("hello", true).unwrap()[0], 1);
        assert_eq!(tok.eos_token_id(), 2);
    }

    #[test]
    fn decodes_words() {
        let tok = tokenizer();
        assert_eq!(tok.decode(&[3]).unwrap(), "hello");
        assert!(tok.decode(&[-1]).is_err());
    }

    #[test]
    fn missing_file_is_tokenizer_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            HfTokenizer::from_pretrained(dir.path()),
            Err(Error::Tokenizer(_))
        ));
    }
}
