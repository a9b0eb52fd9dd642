//! Index samplers.
//!
//! A sampler yields a permutation of `0..n` per epoch. Random order is
//! seeded: the same `(seed, epoch)` always yields the same permutation.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sampler {
    Sequential,
    Random { seed: u64, epoch: u64 },
}

impl Sampler {
    pub fn sequential() -> Self {
        Sampler::Sequential
    }

    pub fn random(seed: u64) -> Self {
        Sampler::Random { seed, epoch: 0 }
    }

    /// Indices for the current epoch; every index in `0..n` exactly once.
    pub fn indices(&self, n: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..n).collect();
        if let Sampler::Random { seed, epoch } = self {
            let mut rng = ChaCha8Rng::seed_from_u64(mix(*seed, *epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Move to the next epoch's permutation. No-op for sequential order.
    pub fn advance_epoch(&mut self) {
        if let Sampler::Random { epoch, .. } = self {
            *epoch = epoch.wrapping_add(1);
        }
    }

    /// Replace the seed and restart at epoch 0.
    pub fn reseed(&mut self, new_seed: u64) {
        if let Sampler::Random { seed, epoch } = self {
            *seed = new_seed;
            *epoch = 0;
        }
    }

    pub fn is_random(&self) -> bool {
        matches!(self, Sampler::Random { .. })
    }
}

/// splitmix64 finalizer over seed and epoch.
fn mix(seed: u64, epoch: u64) -> u64 {
    let mut z = seed ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_order() {
        assert_eq!(Sampler::sequential().indices(5), vec![0, 1, 2, 3, 4]);
        assert!(Sampler::sequential().indices(0).is_empty());
    }

    #[test]
    fn test_random_is_permutation() {
        let mut idx = Sampler::random(7).indices(100);
        idx.sort_unstable();
        assert_eq!(idx, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_random_deterministic_per_seed() {
        let a = Sampler::random(42).indices(50);
        let b = Sampler::random(42).indices(50);
        assert_eq!(a, b);
        assert_ne!(a, Sampler::random(43).indices(50));
    }

    #[test]
    fn test_epochs_differ_and_reseed_restarts() {
        let mut s = Sampler::random(1);
        let first = s.indices(64);
        s.advance_epoch();
        let second = s.indices(64);
        assert_ne!(first, second);

        s.reseed(1);
        assert_eq!(s.indices(64), first);
    }
}
