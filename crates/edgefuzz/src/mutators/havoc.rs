//! Havoc: stacked random edits. Each round applies several small edits to a
//! fresh copy of the input and emits the result, trading precision for
//! diversity. Aggression mode widens the round count, the edits per round,
//! and the weights of the destructive operations.

use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom};

use crate::utils;

const DEFAULT_ROUNDS: usize = 20;
const DEFAULT_MAX_CHANGES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HavocOp {
    Flip,
    FlipNBits,
    Xor,
    Set,
    Arith,
    ArithBlock,
    Insert,
    InsertToken,
    Delete,
    RepeatBlock,
    ShrinkBlock,
    BlockXor,
    CopyBlock,
    Splice,
}

impl HavocOp {
    /// Operations that reshape the input rather than nudging it; these get
    /// the larger weight boost under aggression.
    fn is_destructive(self) -> bool {
        matches!(
            self,
            HavocOp::Flip
                | HavocOp::FlipNBits
                | HavocOp::Insert
                | HavocOp::Delete
                | HavocOp::Splice
                | HavocOp::CopyBlock
                | HavocOp::BlockXor
        )
    }
}

const OP_TABLE: [(HavocOp, f64); 14] = [
    (HavocOp::Flip, 12.0),
    (HavocOp::FlipNBits, 8.0),
    (HavocOp::Xor, 12.0),
    (HavocOp::Set, 10.0),
    (HavocOp::Arith, 10.0),
    (HavocOp::ArithBlock, 6.0),
    (HavocOp::Insert, 8.0),
    (HavocOp::InsertToken, 6.0),
    (HavocOp::Delete, 6.0),
    (HavocOp::RepeatBlock, 6.0),
    (HavocOp::ShrinkBlock, 4.0),
    (HavocOp::BlockXor, 6.0),
    (HavocOp::CopyBlock, 6.0),
    (HavocOp::Splice, 10.0),
];

#[derive(Debug)]
pub struct HavocMutator {
    rng: SmallRng,
    rounds: usize,
    max_changes: usize,
    weights: Vec<f64>,
    corpus: Vec<Arc<[u8]>>,
    tokens: Vec<Vec<u8>>,
    base_rounds: usize,
    base_max_changes: usize,
}

impl HavocMutator {
    pub fn new(seed: u64) -> Self {
        Self::with_params(seed, DEFAULT_ROUNDS, DEFAULT_MAX_CHANGES)
    }

    pub fn with_params(seed: u64, rounds: usize, max_changes: usize) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            rounds,
            max_changes,
            weights: OP_TABLE.iter().map(|(_, weight)| *weight).collect(),
            corpus: Vec::new(),
            tokens: Vec::new(),
            base_rounds: rounds,
            base_max_changes: max_changes,
        }
    }

    pub fn set_corpus(&mut self, corpus: &[Arc<[u8]>]) {
        self.corpus = corpus.to_vec();
    }

    pub fn set_tokens(&mut self, tokens: Vec<Vec<u8>>) {
        self.tokens = tokens;
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn max_changes(&self) -> usize {
        self.max_changes
    }

    /// Widens rounds and edits-per-round by `scale`, and reweights
    /// destructive operations upward more steeply than the rest.
    pub fn apply_aggression(&mut self, scale: f64) {
        let scale = scale.max(1.0);
        self.rounds = ((self.base_rounds as f64 * scale) as usize).max(1);
        self.max_changes = ((self.base_max_changes as f64 * scale) as usize).max(1);
        self.weights = OP_TABLE
            .iter()
            .map(|(op, weight)| {
                let boost = if op.is_destructive() { 1.2 } else { 0.6 };
                (weight * (1.0 + (scale - 1.0) * boost)).max(1.0)
            })
            .collect();
    }

    pub fn clear_aggression(&mut self) {
        self.rounds = self.base_rounds;
        self.max_changes = self.base_max_changes;
        self.weights = OP_TABLE.iter().map(|(_, weight)| *weight).collect();
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        (0..self.rounds)
            .map(|_| {
                let mut out = data.to_vec();
                let changes = self.rng.random_range(1..=self.max_changes);
                for _ in 0..changes {
                    self.random_edit(&mut out);
                }
                out
            })
            .collect()
    }

    fn pick_op(&mut self) -> HavocOp {
        OP_TABLE[utils::weighted_index(&mut self.rng, &self.weights)].0
    }

    fn random_edit(&mut self, data: &mut Vec<u8>) {
        match self.pick_op() {
            HavocOp::Flip => {
                if let Some(index) = self.random_index(data) {
                    data[index] ^= 1 << self.rng.random_range(0..8u32);
                }
            }
            HavocOp::FlipNBits => {
                if let Some(index) = self.random_index(data) {
                    let bits = *[1usize, 2, 4].choose(&mut self.rng).unwrap_or(&1);
                    let mut mask = 0u8;
                    for _ in 0..bits {
                        mask |= 1 << self.rng.random_range(0..8u32);
                    }
                    data[index] ^= mask;
                }
            }
            HavocOp::Xor => {
                if let Some(index) = self.random_index(data) {
                    data[index] ^= self.rng.random_range(1..=255u8);
                }
            }
            HavocOp::Set => {
                if let Some(index) = self.random_index(data) {
                    data[index] = self.rng.random::<u8>();
                }
            }
            HavocOp::Arith => {
                if let Some(index) = self.random_index(data) {
                    let delta = self.rng.random_range(-35..=35i16);
                    data[index] = (i16::from(data[index]) + delta) as u8;
                }
            }
            HavocOp::ArithBlock => self.arith_block(data),
            HavocOp::Insert => {
                let index = self.insertion_index(data);
                data.insert(index, self.rng.random::<u8>());
            }
            HavocOp::InsertToken => self.insert_token(data),
            HavocOp::Delete => {
                if let Some(index) = self.random_index(data) {
                    data.remove(index);
                }
            }
            HavocOp::RepeatBlock => self.repeat_block(data),
            HavocOp::ShrinkBlock => self.shrink_block(data),
            HavocOp::BlockXor => self.block_xor(data),
            HavocOp::CopyBlock => self.copy_block(data),
            HavocOp::Splice => self.splice(data),
        }
    }

    fn random_index(&mut self, data: &[u8]) -> Option<usize> {
        if data.is_empty() {
            None
        } else {
            Some(self.rng.random_range(0..data.len()))
        }
    }

    fn insertion_index(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            0
        } else {
            self.rng.random_range(0..=data.len())
        }
    }

    /// Little-endian arithmetic over a short block.
    fn arith_block(&mut self, data: &mut [u8]) {
        let Some(start) = self.random_index(data) else {
            return;
        };
        let max_len = (data.len() - start).min(4);
        let length = self.rng.random_range(1..=max_len);
        let mut value = 0u64;
        for (index, byte) in data[start..start + length].iter().enumerate() {
            value |= u64::from(*byte) << (8 * index);
        }
        let delta = self.rng.random_range(-500..=500i64);
        let mask = (1u64 << (8 * length)) - 1;
        let updated = (value as i64).wrapping_add(delta) as u64 & mask;
        for (index, byte) in data[start..start + length].iter_mut().enumerate() {
            *byte = ((updated >> (8 * index)) & 0xFF) as u8;
        }
    }

    fn insert_token(&mut self, data: &mut Vec<u8>) {
        let index = self.insertion_index(data);
        let block: Vec<u8> = if !self.tokens.is_empty() && self.rng.random_bool(0.8) {
            self.tokens
                .choose(&mut self.rng)
                .cloned()
                .unwrap_or_default()
        } else {
            (0..self.rng.random_range(1..=8usize))
                .map(|_| self.rng.random::<u8>())
                .collect()
        };
        data.splice(index..index, block);
    }

    fn repeat_block(&mut self, data: &mut Vec<u8>) {
        let Some(start) = self.random_index(data) else {
            return;
        };
        let length = self.rng.random_range(1..=(data.len() - start).min(16));
        let block: Vec<u8> = data[start..start + length].to_vec();
        let times = self.rng.random_range(1..=4usize);
        let index = self.insertion_index(data);
        for _ in 0..times {
            data.splice(index..index, block.iter().copied());
        }
    }

    fn shrink_block(&mut self, data: &mut Vec<u8>) {
        if data.len() < 2 {
            return;
        }
        let start = self.rng.random_range(0..data.len() - 1);
        let length = self.rng.random_range(1..=(data.len() - start).min(16));
        data.drain(start..start + length);
    }

    fn block_xor(&mut self, data: &mut [u8]) {
        let Some(start) = self.random_index(data) else {
            return;
        };
        let length = self.rng.random_range(1..=(data.len() - start).min(16));
        let key = self.rng.random_range(1..=255u8);
        for byte in &mut data[start..start + length] {
            *byte ^= key;
        }
    }

    /// Copies a block from the input itself or a corpus donor and inserts it.
    fn copy_block(&mut self, data: &mut Vec<u8>) {
        let source: Vec<u8> = if !self.corpus.is_empty() && self.rng.random_bool(0.6) {
            self.corpus
                .choose(&mut self.rng)
                .map(|donor| donor.to_vec())
                .unwrap_or_default()
        } else {
            data.clone()
        };
        if source.is_empty() {
            return;
        }
        let start = self.rng.random_range(0..source.len());
        let length = self.rng.random_range(1..=(source.len() - start).min(64));
        let index = self.insertion_index(data);
        data.splice(index..index, source[start..start + length].iter().copied());
    }

    /// Inserts or overwrites with a block taken from a corpus donor.
    fn splice(&mut self, data: &mut Vec<u8>) {
        let Some(donor) = self.corpus.choose(&mut self.rng) else {
            return;
        };
        if donor.is_empty() {
            return;
        }
        let start = self.rng.random_range(0..donor.len());
        let length = self.rng.random_range(1..=(donor.len() - start).min(64));
        let block: Vec<u8> = donor[start..start + length].to_vec();
        if data.is_empty() {
            data.extend_from_slice(&block);
            return;
        }
        let index = self.rng.random_range(0..data.len());
        if self.rng.random_bool(0.5) {
            data.splice(index..index, block);
        } else {
            for (offset, byte) in block.into_iter().enumerate() {
                if index + offset < data.len() {
                    data[index + offset] = byte;
                } else {
                    data.push(byte);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_one_variant_per_round() {
        let mut mutator = HavocMutator::new(1);
        assert_eq!(mutator.mutate(b"hello world").len(), DEFAULT_ROUNDS);
    }

    #[test]
    fn survives_empty_input() {
        let mut mutator = HavocMutator::new(2);
        let variants = mutator.mutate(&[]);
        assert_eq!(variants.len(), DEFAULT_ROUNDS);
    }

    #[test]
    fn aggression_strictly_widens_parameters() {
        let mut mutator = HavocMutator::new(3);
        let (rounds, changes) = (mutator.rounds(), mutator.max_changes());
        mutator.apply_aggression(2.0);
        assert!(mutator.rounds() > rounds);
        assert!(mutator.max_changes() > changes);
        mutator.clear_aggression();
        assert_eq!(mutator.rounds(), rounds);
        assert_eq!(mutator.max_changes(), changes);
    }

    #[test]
    fn aggression_boosts_destructive_ops_more() {
        let mut mutator = HavocMutator::new(3);
        mutator.apply_aggression(2.0);
        let flip_index = OP_TABLE
            .iter()
            .position(|(op, _)| *op == HavocOp::Flip)
            .unwrap();
        let set_index = OP_TABLE
            .iter()
            .position(|(op, _)| *op == HavocOp::Set)
            .unwrap();
        let flip_ratio = mutator.weights[flip_index] / OP_TABLE[flip_index].1;
        let set_ratio = mutator.weights[set_index] / OP_TABLE[set_index].1;
        assert!(flip_ratio > set_ratio);
    }

    #[test]
    fn corpus_splice_pulls_donor_bytes() {
        let mut mutator = HavocMutator::new(4);
        mutator.set_corpus(&[Arc::from(&b"DONORDONORDONOR"[..])]);
        // With splice weighted in, some variant should contain donor bytes.
        let found = (0..50).any(|_| {
            mutator
                .mutate(b"\x00\x00\x00\x00")
                .iter()
                .any(|variant| variant.windows(5).any(|window| window == b"DONOR"))
        });
        assert!(found);
    }

    #[test]
    fn tokens_are_injected() {
        let mut mutator = HavocMutator::new(5);
        mutator.set_tokens(vec![b"MAGICTOKEN".to_vec()]);
        let found = (0..50).any(|_| {
            mutator
                .mutate(b"\x01\x02")
                .iter()
                .any(|variant| {
                    variant
                        .windows(b"MAGICTOKEN".len())
                        .any(|window| window == b"MAGICTOKEN")
                })
        });
        assert!(found);
    }
}
