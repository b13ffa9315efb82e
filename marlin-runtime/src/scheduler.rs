//! Prefill chunk planning and generation budgeting.
//!
//! Pure host arithmetic; nothing here touches the compute engine.

#![allow(clippy::module_name_repetitions)]

/// A contiguous slice of the prompt submitted in one prefill call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Absolute start within the whole prompt.
    pub offset: usize,
    pub len: usize,
}

impl Chunk {
    /// Index range of this chunk in the prompt.
    #[must_use]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Tokens processed once this chunk has run.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Iterator over the chunks of a prompt, in order.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total: usize,
    chunk_length: usize,
    next: usize,
}

/// Split `total` tokens into `ceil(total / chunk_length)` chunks.
///
/// Every chunk but the last has exactly `chunk_length` tokens. A
/// `chunk_length` of zero yields nothing.
#[must_use]
pub fn plan_chunks(total: usize, chunk_length: usize) -> ChunkPlan {
    ChunkPlan {
        total,
        chunk_length,
        next: 0,
    }
}

impl ChunkPlan {
    /// Number of chunks still to come.
    #[must_use]
    pub fn remaining(&self) -> usize {
        if self.chunk_length == 0 {
            return 0;
        }
        (self.total - self.next).div_ceil(self.chunk_length)
    }
}

impl Iterator for ChunkPlan {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.chunk_length == 0 || self.next >= self.total {
            return None;
        }
        let len = self.chunk_length.min(self.total - self.next);
        let chunk = Chunk {
            offset: self.next,
            len,
        };
        self.next += len;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl ExactSizeIterator for ChunkPlan {}

/// Largest number of tokens that can be generated after a prompt of
/// `prompt_len` tokens, capped at `requested`.
///
/// The first token comes from prefill; each later token needs one more
/// cache slot, so `prompt_len + budget - 1` may not exceed
/// `max_total_length`.
#[must_use]
pub fn generation_budget(prompt_len: usize, requested: usize, max_total_length: usize) -> usize {
    let allowed = (max_total_length + 1).saturating_sub(prompt_len);
    requested.min(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_prompt_splits_into_three_chunks() {
        let chunks: Vec<Chunk> = plan_chunks(2500, 1024).collect();
        assert_eq!(
            chunks,
            vec![
                Chunk { offset: 0, len: 1024 },
                Chunk { offset: 1024, len: 1024 },
                Chunk { offset: 2048, len: 452 },
            ]
        );
    }

    #[test]
    fn chunks_cover_prompt_exactly() {
        for total in [1, 7, 1023, 1024, 1025, 4096] {
            for chunk_length in [1, 3, 512, 1024, 5000] {
                let plan = plan_chunks(total, chunk_length);
                assert_eq!(plan.len(), total.div_ceil(chunk_length));
                let chunks: Vec<Chunk> = plan.collect();
                let mut expected_offset = 0;
                for chunk in &chunks {
                    assert_eq!(chunk.offset, expected_offset);
                    assert!(chunk.len > 0 && chunk.len <= chunk_length);
                    expected_offset = chunk.end();
                }
                assert_eq!(expected_offset, total);
            }
        }
    }

    #[test]
    fn empty_prompt_has_no_chunks() {
        assert_eq!(plan_chunks(0, 1024).count(), 0);
        assert_eq!(plan_chunks(10, 0).count(), 0);
    }

    #[test]
    fn budget_respects_capacity() {
        assert_eq!(generation_budget(10, 5, 100), 5);
        // 96 prompt tokens + 5 generated - 1 = 100
        assert_eq!(generation_budget(96, 50, 100), 5);
        assert_eq!(generation_budget(100, 50, 100), 1);
        assert_eq!(generation_budget(101, 50, 100), 0);
    }
}
