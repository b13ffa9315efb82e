//! `SafeTensors` shard reading with memory mapping

#![allow(clippy::doc_markdown)]

use memmap2::Mmap;
use safetensors::tensor::SafeTensors;
use std::fs::File;
use std::path::Path;

use super::host::HostTensor;
use crate::dtype::DType;
use crate::Result;

/// Read every tensor in a SafeTensors file, one at a time.
///
/// The file is memory-mapped and each tensor is copied into an owned
/// [`HostTensor`] just before `visit` receives it, so only one tensor is
/// duplicated in host memory at any moment. Tensors are visited in name
/// order.
///
/// Returns the number of tensors visited.
///
/// # Errors
/// Returns an error if the file cannot be mapped or parsed, if a tensor has
/// an unsupported dtype, or if `visit` fails.
pub fn visit_tensors<F>(path: &Path, mut visit: F) -> Result<usize>
where
    F: FnMut(String, HostTensor) -> Result<()>,
{
    let file = File::open(path)?;
    // SAFETY: the map is read-only and dropped before this function returns;
    // checkpoint files are not expected to be modified while loading.
    let mmap = unsafe { Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)?;

    let mut entries = st.tensors();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let count = entries.len();
    for (name, view) in entries {
        let dtype = DType::from_safetensors(view.dtype())?;
        let tensor = HostTensor::new(view.shape().to_vec(), dtype, view.data().to_vec())?;
        visit(name, tensor)?;
    }
    Ok(count)
}
