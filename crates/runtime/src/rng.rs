use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

/// Per-experiment seedable random source. Every stochastic decision in the
/// episode loop — scenario synthesis, ε-greedy tie-breaking, outcome
/// simulation — draws from this, never from a process-wide generator, so
/// that `reset` followed by `start` with the same seed reproduces an
/// identical episode-by-episode trace.
#[derive(Debug, Clone)]
pub struct SeededRng {
    inner: StdRng,
    seed: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self { inner: StdRng::seed_from_u64(seed), seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    pub fn uniform_index(&mut self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            self.inner.gen_range(0..len)
        }
    }

    pub fn uniform_range_u8(&mut self, low: u8, high_inclusive: u8) -> u8 {
        self.inner.gen_range(low..=high_inclusive)
    }

    pub fn outcome_rolls(&mut self) -> [f64; 4] {
        [self.uniform(), self.uniform(), self.uniform(), self.uniform()]
    }
}
