//! Deterministic random numbers for generators.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Small explicit PRNG threaded through generation code.
///
/// Every generator owns its instance; there is no global random state, so the
/// same seed always carves the same dungeon.
#[derive(Debug, Clone)]
pub struct PseudoRandom {
    rng: ChaCha8Rng,
}

impl PseudoRandom {
    /// Largest value returned by [`next_int`](Self::next_int).
    pub const RANDOM_MAX: i32 = 0x7fff;

    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Next value in `0..=RANDOM_MAX`.
    #[inline]
    pub fn next_int(&mut self) -> i32 {
        (self.rng.next_u32() & 0x7fff) as i32
    }

    /// Uniform value in `min..=max`; returns `min` when the range is empty.
    #[inline]
    pub fn range(&mut self, min: i32, max: i32) -> i32 {
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..=max)
    }
}
