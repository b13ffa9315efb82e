//! Host copies of device logits.

use crate::{Error, Result};

/// Logits rows copied off the device, as f32.
#[derive(Debug, Clone, PartialEq)]
pub struct HostLogits {
    data: Vec<f32>,
    vocab_size: usize,
}

impl HostLogits {
    /// Wrap `rows × vocab_size` values in row-major order.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `data` is not a whole number of rows.
    pub fn new(data: Vec<f32>, vocab_size: usize) -> Result<Self> {
        if vocab_size == 0 || data.len() % vocab_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} logits do not form rows of {vocab_size}",
                data.len()
            )));
        }
        Ok(Self { data, vocab_size })
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.data.len() / self.vocab_size
    }

    /// Row `index`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `index` is out of range.
    pub fn row(&self, index: usize) -> Result<&[f32]> {
        if index >= self.rows() {
            return Err(Error::InvalidArgument(format!(
                "logits row {index} out of range ({} rows)",
                self.rows()
            )));
        }
        let start = index * self.vocab_size;
        Ok(&self.data[start..start + self.vocab_size])
    }
}

/// Index of the largest value; ties resolve to the lowest index and NaN
/// never wins.
///
/// # Errors
/// Returns `InvalidArgument` on an empty slice.
pub fn argmax(values: &[f32]) -> Result<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    match best {
        Some((i, _)) => Ok(i),
        // all NaN
        None if !values.is_empty() => Ok(0),
        None => Err(Error::InvalidArgument("argmax of empty logits".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_sliced_by_vocab() {
        let logits = HostLogits::new(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 3).unwrap();
        assert_eq!(logits.rows(), 2);
        assert_eq!(logits.row(1).unwrap(), &[3.0, 4.0, 5.0]);
        assert!(logits.row(2).is_err());
    }

    #[test]
    fn ragged_data_is_rejected() {
        assert!(HostLogits::new(vec![0.0; 5], 3).is_err());
        assert!(HostLogits::new(vec![], 0).is_err());
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, -1.0]).unwrap(), 1);
        assert_eq!(argmax(&[f32::NAN, 0.5, 0.25]).unwrap(), 1);
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY]).unwrap(), 0);
        assert!(argmax(&[]).is_err());
    }
}
