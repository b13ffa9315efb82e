//! Checkpoint discovery inside a model directory.
//!
//! A directory resolves to exactly one [`CheckpointSource`]: a sharded index
//! (`*.bin.index.json` / `*.safetensors.index.json`) wins over consolidated
//! files (`*.bin`, `*.safetensors`, `*.pt`). Anything ambiguous is an error,
//! except that a directory with several consolidated files may still be
//! resolved by the exact name [`MARLIN_CONSOLIDATED`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

const INDEX_SUFFIXES: [&str; 2] = ["bin.index.json", "safetensors.index.json"];
const CONSOLIDATED_SUFFIXES: [&str; 3] = ["bin", "safetensors", "pt"];

/// Consolidated file name produced by GPTQ → Marlin repacking.
pub const MARLIN_CONSOLIDATED: &str = "model_gptq_marlin.safetensors";

/// The one checkpoint a model directory resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
    /// A sharded-index JSON whose `weight_map` names the shard files.
    Index(PathBuf),
    /// A single consolidated checkpoint file.
    Consolidated(PathBuf),
}

/// On-disk encoding of a single shard file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardFormat {
    SafeTensors,
    /// PyTorch pickle (`.bin`, `.pt`)
    Pickle,
}

impl ShardFormat {
    /// Classify a shard by extension.
    ///
    /// # Errors
    /// Returns `UnsupportedFormat` for any other extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => Ok(Self::SafeTensors),
            Some("bin" | "pt") => Ok(Self::Pickle),
            _ => Err(Error::UnsupportedFormat(path.display().to_string())),
        }
    }
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

impl CheckpointSource {
    /// Path of the resolved index or consolidated file.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Index(path) | Self::Consolidated(path) => path,
        }
    }

    /// Concrete shard files to read, in a deterministic order.
    ///
    /// For an index this is the de-duplicated set of `weight_map` values,
    /// resolved relative to the index's directory.
    ///
    /// # Errors
    /// Returns an error if the index cannot be read or parsed.
    pub fn shard_files(&self) -> Result<Vec<PathBuf>> {
        match self {
            Self::Consolidated(path) => Ok(vec![path.clone()]),
            Self::Index(path) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let content = std::fs::read_to_string(path)?;
                let index: ShardIndex = serde_json::from_str(&content)?;
                let files: BTreeSet<String> = index.weight_map.into_values().collect();
                Ok(files.into_iter().map(|f| dir.join(f)).collect())
            }
        }
    }
}

impl fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(path) => write!(f, "index {}", path.display()),
            Self::Consolidated(path) => write!(f, "consolidated {}", path.display()),
        }
    }
}

/// Resolve `dir` to exactly one checkpoint source.
///
/// # Errors
/// Returns `CheckpointResolution` when several index files exist, when
/// several consolidated files exist and none is [`MARLIN_CONSOLIDATED`], or
/// when nothing matches.
pub fn resolve_checkpoint(dir: impl AsRef<Path>) -> Result<CheckpointSource> {
    let dir = dir.as_ref();
    let names = list_file_names(dir)?;

    let indexes = matching(&names, &INDEX_SUFFIXES);
    match indexes.as_slice() {
        [] => {}
        [single] => return Ok(CheckpointSource::Index(dir.join(single))),
        many => {
            return Err(Error::CheckpointResolution(format!(
                "Multiple index files found in {}: {}",
                dir.display(),
                many.join(", ")
            )));
        }
    }

    let candidates = matching(&names, &CONSOLIDATED_SUFFIXES);
    match candidates.as_slice() {
        [] => Err(Error::CheckpointResolution(format!(
            "No supported checkpoint file found in {}, supported suffixes: {}",
            dir.display(),
            INDEX_SUFFIXES
                .iter()
                .chain(CONSOLIDATED_SUFFIXES.iter())
                .copied()
                .collect::<Vec<_>>()
                .join(", ")
        ))),
        [single] => Ok(CheckpointSource::Consolidated(dir.join(single))),
        many => {
            tracing::info!(files = ?many, "Found multiple consolidated checkpoints");
            if many.iter().any(|name| name == MARLIN_CONSOLIDATED) {
                Ok(CheckpointSource::Consolidated(dir.join(MARLIN_CONSOLIDATED)))
            } else {
                Err(Error::CheckpointResolution(format!(
                    "Multiple checkpoints in {} and no {MARLIN_CONSOLIDATED} among them",
                    dir.display()
                )))
            }
        }
    }
}

/// Regular, non-hidden file names in `dir`, sorted.
fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn matching(names: &[String], suffixes: &[&str]) -> Vec<String> {
    names
        .iter()
        .filter(|name| {
            suffixes
                .iter()
                .any(|suffix| name.ends_with(&format!(".{suffix}")))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn single_consolidated_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "model.safetensors");
        touch(dir.path(), "config.json");
        let source = resolve_checkpoint(dir.path()).unwrap();
        assert_eq!(
            source,
            CheckpointSource::Consolidated(dir.path().join("model.safetensors"))
        );
    }

    #[test]
    fn index_takes_precedence_over_shards() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "model-00001-of-00002.safetensors");
        touch(dir.path(), "model-00002-of-00002.safetensors");
        touch(dir.path(), "model.safetensors.index.json");
        let source = resolve_checkpoint(dir.path()).unwrap();
        assert!(matches!(source, CheckpointSource::Index(_)));
    }

    #[test]
    fn two_index_files_are_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "pytorch_model.bin.index.json");
        touch(dir.path(), "model.safetensors.index.json");
        assert!(matches!(
            resolve_checkpoint(dir.path()),
            Err(Error::CheckpointResolution(_))
        ));
    }

    #[test]
    fn marlin_file_breaks_consolidated_tie() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "model.safetensors");
        touch(dir.path(), MARLIN_CONSOLIDATED);
        let source = resolve_checkpoint(dir.path()).unwrap();
        assert_eq!(source.path(), dir.path().join(MARLIN_CONSOLIDATED));
    }

    #[test]
    fn multiple_consolidated_without_marlin_fails() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "model.safetensors");
        touch(dir.path(), "pytorch_model.bin");
        assert!(matches!(
            resolve_checkpoint(dir.path()),
            Err(Error::CheckpointResolution(_))
        ));
    }

    #[test]
    fn empty_directory_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "config.json");
        let err = resolve_checkpoint(dir.path()).unwrap_err();
        assert!(err.to_string().contains("No supported checkpoint file"));
    }

    #[test]
    fn index_shards_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"metadata": {}, "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        )
        .unwrap();
        let source = resolve_checkpoint(dir.path()).unwrap();
        let shards = source.shard_files().unwrap();
        assert_eq!(
            shards,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn shard_format_from_extension() {
        assert_eq!(
            ShardFormat::from_path(Path::new("a.safetensors")).unwrap(),
            ShardFormat::SafeTensors
        );
        assert_eq!(
            ShardFormat::from_path(Path::new("a.pt")).unwrap(),
            ShardFormat::Pickle
        );
        assert!(ShardFormat::from_path(Path::new("a.gguf")).is_err());
    }
}
