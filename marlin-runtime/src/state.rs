//! Fixed per-engine decode scalars.

/// Scalars rewritten in place on every decode step, plus the shared
/// logits buffer.
///
/// Allocated once after storage initialisation and never reallocated, so
/// a captured device graph always sees the same buffers.
#[derive(Debug)]
pub struct GenerationState<L> {
    pub input_ids: [i32; 1],
    pub position_ids: [i32; 1],
    /// Tokens already in the key/value cache.
    pub cache_length: [i32; 1],
    pub logits: L,
}

impl<L> GenerationState<L> {
    /// Zeroed scalars around a freshly allocated logits buffer.
    #[must_use]
    pub fn new(logits: L) -> Self {
        Self {
            input_ids: [0],
            position_ids: [0],
            cache_length: [0],
            logits,
        }
    }

    /// Prepare the scalars for decoding `token` at `position`, with
    /// `position` tokens already cached.
    pub fn set_step(&mut self, token: i32, position: i32) {
        self.input_ids[0] = token;
        self.position_ids[0] = position;
        self.cache_length[0] = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_step_writes_in_place() {
        let mut state = GenerationState::new(());
        let before = state.input_ids.as_ptr();
        state.set_step(42, 17);
        assert_eq!(state.input_ids, [42]);
        assert_eq!(state.position_ids, [17]);
        assert_eq!(state.cache_length, [17]);
        assert_eq!(state.input_ids.as_ptr(), before);
    }
}
