//! Interesting-value substitution: canonical boundary constants dropped
//! into byte, word, and dword positions near the start of the input.

use rand::{SeedableRng, rngs::SmallRng};

use super::arith::WordEndian;

/// Substitutions are confined to the first positions of the input.
const DEFAULT_MAX_POSITIONS: usize = 32;

const INTERESTING_8: [u64; 5] = [0, 1, 0x7f, 0x80, 0xff];
const INTERESTING_16: [u64; 5] = [0, 1, 0x7fff, 0x8000, 0xffff];
const INTERESTING_32: [u64; 5] = [0, 1, 0x7fff_ffff, 0x8000_0000, 0xffff_ffff];

#[derive(Debug)]
pub struct InterestMutator {
    // RNG kept for parity with the other mutators' constructors; the
    // substitution grid itself is deterministic.
    _rng: SmallRng,
    max_positions: usize,
    extra_values: Vec<u64>,
    endian: WordEndian,
}

impl InterestMutator {
    pub fn new(seed: u64) -> Self {
        Self {
            _rng: SmallRng::seed_from_u64(seed),
            max_positions: DEFAULT_MAX_POSITIONS,
            extra_values: Vec::new(),
            endian: WordEndian::Little,
        }
    }

    /// Adds user-supplied values to every width's substitution pool.
    pub fn with_extra_values(seed: u64, extra_values: Vec<u64>) -> Self {
        Self {
            extra_values,
            ..Self::new(seed)
        }
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return Vec::new();
        }
        let max_pos = data.len().min(self.max_positions);
        let mut variants = Vec::new();

        for pos in 0..max_pos {
            for value in self.pool(&INTERESTING_8, 0xFF) {
                for candidate in [value, value.wrapping_sub(1) & 0xFF, (value + 1) & 0xFF] {
                    if let Some(variant) = self.replace_word(data, pos, 1, candidate) {
                        variants.push(variant);
                    }
                }
            }
        }

        for pos in 0..max_pos {
            for value in self.pool(&INTERESTING_16, 0xFFFF) {
                for candidate in [value, value.wrapping_sub(1) & 0xFFFF, (value + 1) & 0xFFFF] {
                    if let Some(variant) = self.replace_word(data, pos, 2, candidate) {
                        variants.push(variant);
                    }
                }
            }
        }

        for pos in 0..max_pos {
            for value in self.pool(&INTERESTING_32, 0xFFFF_FFFF) {
                for candidate in [
                    value,
                    value.wrapping_sub(1) & 0xFFFF_FFFF,
                    (value + 1) & 0xFFFF_FFFF,
                ] {
                    if let Some(variant) = self.replace_word(data, pos, 4, candidate) {
                        variants.push(variant);
                    }
                }
            }
        }

        variants
    }

    fn pool(&self, canonical: &[u64], mask: u64) -> Vec<u64> {
        canonical
            .iter()
            .copied()
            .chain(self.extra_values.iter().map(|value| value & mask))
            .collect()
    }

    fn replace_word(&self, data: &[u8], offset: usize, width: usize, value: u64) -> Option<Vec<u8>> {
        if offset + width > data.len() {
            return None;
        }
        let mut out = data.to_vec();
        for (index, byte) in out[offset..offset + width].iter_mut().enumerate() {
            let shift = match self.endian {
                WordEndian::Little => 8 * index,
                WordEndian::Big => 8 * (width - 1 - index),
            };
            *byte = ((value >> shift) & 0xFF) as u8;
        }
        if out == data { None } else { Some(out) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_nothing() {
        let mut mutator = InterestMutator::new(1);
        assert!(mutator.mutate(&[]).is_empty());
    }

    #[test]
    fn canonical_values_appear_in_variants() {
        let mut mutator = InterestMutator::new(1);
        let data = vec![0x42u8; 8];
        let variants = mutator.mutate(&data);
        assert!(variants.iter().any(|v| v[0] == 0x7f));
        assert!(variants.iter().any(|v| v[0] == 0x80));
        // 16-bit 0x8000 little endian at offset 0.
        assert!(variants.iter().any(|v| v[0] == 0x00 && v[1] == 0x80));
        // 32-bit 0x7fffffff little endian at offset 0.
        assert!(
            variants
                .iter()
                .any(|v| v[..4] == [0xff, 0xff, 0xff, 0x7f])
        );
    }

    #[test]
    fn neighbors_of_canonical_values_appear() {
        let mut mutator = InterestMutator::new(1);
        let data = vec![0x42u8; 4];
        let variants = mutator.mutate(&data);
        // 0x7f - 1 and 0x7f + 1.
        assert!(variants.iter().any(|v| v[0] == 0x7e));
        assert!(variants.iter().any(|v| v[0] == 0x81));
    }

    #[test]
    fn extra_values_extend_the_pool() {
        let mut mutator = InterestMutator::with_extra_values(1, vec![0x1337]);
        let data = vec![0u8; 4];
        let variants = mutator.mutate(&data);
        assert!(variants.iter().any(|v| v[0] == 0x37 && v[1] == 0x13));
    }

    #[test]
    fn positions_are_bounded() {
        let mut mutator = InterestMutator::new(1);
        let data = vec![0x42u8; 256];
        for variant in mutator.mutate(&data) {
            // Nothing past the position window plus the widest word changes.
            assert_eq!(&variant[DEFAULT_MAX_POSITIONS + 4..], &data[DEFAULT_MAX_POSITIONS + 4..]);
        }
    }

    #[test]
    fn identity_substitutions_are_skipped() {
        let mutator = InterestMutator::new(1);
        assert!(mutator.replace_word(&[0x00], 0, 1, 0).is_none());
    }
}
