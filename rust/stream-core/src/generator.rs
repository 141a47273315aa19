// rust/stream-core/src/generator.rs

//! Serializable random generator handle.
//!
//! A `Generator` is a `(seed, position)` pair. Every draw derives a fresh
//! `StdRng` from the pair and then advances the position, so the full state
//! is two integers that can be stored in a snapshot and restored exactly.
//! Operators that must not disturb a shared generator call [`Generator::fork`]
//! and draw from the copy.
//!
//! # Example
//!
//! ```
//! use stream_core::generator::Generator;
//!
//! let mut a = Generator::new(42);
//! let mut b = a.fork();
//! assert_eq!(a.integers(10, 5), b.integers(10, 5));
//! assert_eq!(a.position(), 1);
//! ```

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// 2^63, the modulus used when reseeding per epoch.
const EPOCH_MODULUS: i128 = 1 << 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    seed: u64,
    position: u64,
}

impl Generator {
    pub fn new(seed: u64) -> Self {
        Self { seed, position: 0 }
    }

    /// A generator seeded from the thread RNG.
    pub fn from_entropy() -> Self {
        Self::new(rand::random())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns an independent copy with the same state.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    fn next_rng(&mut self) -> StdRng {
        let stream = self.seed ^ self.position.wrapping_add(1).wrapping_mul(GOLDEN_GAMMA);
        self.position += 1;
        StdRng::seed_from_u64(stream)
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        let mut rng = self.next_rng();
        items.shuffle(&mut rng);
    }

    /// A random permutation of `0..n`.
    pub fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..n).collect();
        self.shuffle(&mut indices);
        indices
    }

    /// `size` integers drawn uniformly from `0..high`.
    pub fn integers(&mut self, high: usize, size: usize) -> Vec<usize> {
        let mut rng = self.next_rng();
        if high == 0 {
            return Vec::new();
        }
        (0..size).map(|_| rng.gen_range(0..high)).collect()
    }

    /// `size` indices drawn with the given relative weights.
    ///
    /// # Errors
    ///
    /// Returns a config error if the weights are empty, negative or all zero.
    pub fn choice(&mut self, weights: &[f64], size: usize) -> Result<Vec<usize>> {
        let dist = WeightedIndex::new(weights).map_err(|e| {
            StreamError::config_with_source(format!("invalid probabilities {weights:?}"), e)
        })?;
        let mut rng = self.next_rng();
        Ok((0..size).map(|_| dist.sample(&mut rng)).collect())
    }

    /// A non-negative integer below 2^63.
    pub fn next_u63(&mut self) -> u64 {
        let mut rng = self.next_rng();
        rng.gen::<u64>() >> 1
    }

    /// The generator to use for a given epoch.
    ///
    /// Epoch 0 uses this generator as is. Later epochs draw a base seed from
    /// a fork and subtract the epoch, wrapping into `[0, 2^63)`.
    pub fn effective_epoch_generator(&self, epoch: u64) -> Generator {
        if epoch == 0 {
            return self.clone();
        }
        let base = self.fork().next_u63() as i128;
        let seed = (base - epoch as i128).rem_euclid(EPOCH_MODULUS) as u64;
        Generator::new(seed)
    }
}
