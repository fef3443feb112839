//! Bit-flip mutations: single bits, bit pairs, whole bytes, and contiguous
//! byte windows, concentrated on positions likely to carry information.

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Hard cap on the number of variants one invocation produces.
const DEFAULT_SAMPLE_LIMIT: usize = 256;

const WINDOW_SIZES: [usize; 3] = [2, 4, 8];

#[derive(Debug)]
pub struct BitFlipMutator {
    rng: SmallRng,
    sample_limit: usize,
}

impl BitFlipMutator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }

    pub fn with_sample_limit(seed: u64, sample_limit: usize) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            sample_limit: sample_limit.max(1),
        }
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return Vec::new();
        }

        let positions = self.sample_positions(data);
        let mut variants = Vec::new();

        for pos in positions {
            if variants.len() >= self.sample_limit {
                break;
            }

            // Single bit at the sampled byte.
            let mut out = data.to_vec();
            out[pos] ^= 1 << self.rng.random_range(0..8u32);
            variants.push(out);

            // Two-bit pair within the byte.
            if variants.len() < self.sample_limit && self.rng.random_bool(0.3) {
                let mut out = data.to_vec();
                let first = self.rng.random_range(0..8u32);
                let second = (first + self.rng.random_range(1..8u32)) % 8;
                out[pos] ^= (1 << first) | (1 << second);
                variants.push(out);
            }

            // Whole-byte inversion.
            if variants.len() < self.sample_limit && self.rng.random_bool(0.25) {
                let mut out = data.to_vec();
                out[pos] ^= 0xFF;
                variants.push(out);
            }

            // Contiguous window inversion.
            if variants.len() < self.sample_limit && self.rng.random_bool(0.15) {
                let width = WINDOW_SIZES[self.rng.random_range(0..WINDOW_SIZES.len())];
                if pos + width <= data.len() {
                    let mut out = data.to_vec();
                    for byte in &mut out[pos..pos + width] {
                        *byte ^= 0xFF;
                    }
                    variants.push(out);
                }
            }
        }

        // Top up short batches with a few global multi-bit flips.
        while variants.len() < self.sample_limit.min(16) {
            let mut out = data.to_vec();
            for _ in 0..self.rng.random_range(1..=16usize) {
                let pos = self.rng.random_range(0..out.len());
                out[pos] ^= 1 << self.rng.random_range(0..8u32);
            }
            variants.push(out);
        }

        variants
    }

    /// Samples byte positions with replacement, weighted to favor bytes
    /// that are neither 0x00 nor 0xFF and to prefer printable ASCII.
    fn sample_positions(&mut self, data: &[u8]) -> Vec<usize> {
        let weights: Vec<f64> = data.iter().map(|byte| byte_weight(*byte)).collect();
        let total: f64 = weights.iter().sum();
        let count = data.len().min(self.sample_limit);
        (0..count)
            .map(|_| {
                let mut roll = self.rng.random_range(0.0..total);
                for (index, weight) in weights.iter().enumerate() {
                    if roll < *weight {
                        return index;
                    }
                    roll -= *weight;
                }
                data.len() - 1
            })
            .collect()
    }
}

fn byte_weight(byte: u8) -> f64 {
    let score = if byte == 0x00 || byte == 0xFF {
        0.1
    } else if (0x20..=0x7e).contains(&byte) {
        1.0
    } else {
        0.5
    };
    score + 0.01
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_nothing() {
        let mut mutator = BitFlipMutator::new(1);
        assert!(mutator.mutate(&[]).is_empty());
    }

    #[test]
    fn respects_the_sample_limit() {
        let mut mutator = BitFlipMutator::with_sample_limit(1, 32);
        let data = vec![0x41u8; 1024];
        assert!(mutator.mutate(&data).len() <= 32);
    }

    #[test]
    fn every_variant_differs_from_the_input() {
        let mut mutator = BitFlipMutator::new(7);
        let data = b"informative bytes".to_vec();
        for variant in mutator.mutate(&data) {
            assert_ne!(variant, data);
        }
    }

    #[test]
    fn single_byte_seed_can_reach_nearby_values() {
        // The `@` -> `A` jump: flipping the lowest bit. Drawing enough
        // batches makes missing it astronomically unlikely.
        let mut mutator = BitFlipMutator::new(11);
        let reached = (0..64).any(|_| {
            mutator
                .mutate(b"@")
                .iter()
                .any(|variant| variant[0] == b'A')
        });
        assert!(reached);
    }

    #[test]
    fn printable_bytes_are_favored() {
        assert!(byte_weight(b'a') > byte_weight(0x00));
        assert!(byte_weight(b'a') > byte_weight(0xFF));
        assert!(byte_weight(0x05) > byte_weight(0x00));
    }
}
