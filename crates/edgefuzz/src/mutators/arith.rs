//! Arithmetic mutations: small additive deltas over 1/2/4-byte words,
//! aimed at integer boundaries and off-by-one paths in the target.

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::SliceRandom};

/// How many byte positions one invocation samples.
const DEFAULT_MAX_POSITIONS: usize = 32;

/// Deltas always tried: small steps plus boundary neighbors.
const DEFAULT_DELTAS: [i64; 12] = [1, -1, 2, -2, 8, -8, 16, -16, 127, -128, 255, -255];

/// Deltas applied per (position, width) pair.
const DELTAS_PER_WORD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordEndian {
    Little,
    Big,
}

#[derive(Debug)]
pub struct ArithMutator {
    rng: SmallRng,
    max_positions: usize,
    widths: Vec<usize>,
    endian: WordEndian,
    /// Wrap modulo the word size by default; saturate when disabled.
    wrap: bool,
}

impl ArithMutator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            max_positions: DEFAULT_MAX_POSITIONS,
            widths: vec![1, 2, 4],
            endian: WordEndian::Little,
            wrap: true,
        }
    }

    pub fn with_endian(seed: u64, endian: WordEndian) -> Self {
        Self {
            endian,
            ..Self::new(seed)
        }
    }

    pub fn saturating(seed: u64) -> Self {
        Self {
            wrap: false,
            ..Self::new(seed)
        }
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return Vec::new();
        }

        let mut positions: Vec<usize> = (0..data.len()).collect();
        positions.shuffle(&mut self.rng);
        positions.truncate(self.max_positions);

        let mut deltas: Vec<i64> = DEFAULT_DELTAS.to_vec();
        deltas.extend((0..4).map(|_| self.rng.random_range(-1000..=1000i64)));

        let widths = self.widths.clone();
        let mut variants = Vec::new();
        for pos in positions {
            for width in &widths {
                if pos + width > data.len() {
                    continue;
                }
                deltas.shuffle(&mut self.rng);
                for delta in deltas.iter().take(DELTAS_PER_WORD) {
                    if let Some(variant) = self.apply_word(data, pos, *width, *delta) {
                        variants.push(variant);
                    }
                }
            }
        }
        variants
    }

    /// Adds `delta` to the `width`-byte word at `offset`.
    fn apply_word(&self, data: &[u8], offset: usize, width: usize, delta: i64) -> Option<Vec<u8>> {
        let word = data.get(offset..offset + width)?;
        let mask = if width >= 8 {
            u64::MAX
        } else {
            (1u64 << (width * 8)) - 1
        };

        let value = match self.endian {
            WordEndian::Little => word
                .iter()
                .rev()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
            WordEndian::Big => word
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        };

        let updated = if self.wrap {
            (value as i64).wrapping_add(delta) as u64 & mask
        } else {
            (value as i64)
                .saturating_add(delta)
                .clamp(0, mask as i64) as u64
        };
        if updated == value {
            return None;
        }

        let mut out = data.to_vec();
        for (index, byte) in out[offset..offset + width].iter_mut().enumerate() {
            let shift = match self.endian {
                WordEndian::Little => 8 * index,
                WordEndian::Big => 8 * (width - 1 - index),
            };
            *byte = ((updated >> shift) & 0xFF) as u8;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_nothing() {
        let mut mutator = ArithMutator::new(1);
        assert!(mutator.mutate(&[]).is_empty());
    }

    #[test]
    fn variants_preserve_length() {
        let mut mutator = ArithMutator::new(5);
        let data = b"0123456789abcdef".to_vec();
        let variants = mutator.mutate(&data);
        assert!(!variants.is_empty());
        for variant in variants {
            assert_eq!(variant.len(), data.len());
        }
    }

    #[test]
    fn single_byte_wraps_modulo_256() {
        let mutator = ArithMutator::new(1);
        let out = mutator.apply_word(&[0xFF], 0, 1, 1).unwrap();
        assert_eq!(out, vec![0x00]);
        let out = mutator.apply_word(&[0x00], 0, 1, -1).unwrap();
        assert_eq!(out, vec![0xFF]);
    }

    #[test]
    fn little_endian_word_arithmetic() {
        let mutator = ArithMutator::new(1);
        // 0x00FF + 1 = 0x0100 in little endian.
        let out = mutator.apply_word(&[0xFF, 0x00], 0, 2, 1).unwrap();
        assert_eq!(out, vec![0x00, 0x01]);
    }

    #[test]
    fn big_endian_word_arithmetic() {
        let mutator = ArithMutator::with_endian(1, WordEndian::Big);
        let out = mutator.apply_word(&[0x00, 0xFF], 0, 2, 1).unwrap();
        assert_eq!(out, vec![0x01, 0x00]);
    }

    #[test]
    fn saturating_mode_clamps_at_bounds() {
        let mutator = ArithMutator::saturating(1);
        assert!(mutator.apply_word(&[0x00], 0, 1, -5).is_none());
        let out = mutator.apply_word(&[0xFE], 0, 1, 100).unwrap();
        assert_eq!(out, vec![0xFF]);
    }

    #[test]
    fn zero_effect_deltas_are_skipped() {
        let mutator = ArithMutator::new(1);
        assert!(mutator.apply_word(&[0x10], 0, 1, 0).is_none());
    }
}
