//! Composite mutation: chains several mutators from a pool, feeding a
//! randomly chosen intermediate variant into the next stage.

use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::Mutator;

#[derive(Debug)]
pub struct CompositeMutator {
    rng: SmallRng,
    pool: Vec<Mutator>,
    /// Chained mutator calls per invocation, drawn from 1..=max_calls.
    max_calls: usize,
    /// Variants kept from each call.
    per_call: usize,
}

impl CompositeMutator {
    pub fn new(seed: u64, pool: Vec<Mutator>, max_calls: usize, per_call: usize) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            pool,
            max_calls: max_calls.max(1),
            per_call: per_call.max(1),
        }
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if self.pool.is_empty() {
            return Vec::new();
        }
        let calls = self.rng.random_range(1..=self.max_calls);
        let mut current: Vec<u8> = data.to_vec();
        let mut collected = Vec::new();
        for _ in 0..calls {
            let index = self.rng.random_range(0..self.pool.len());
            let mut batch = self.pool[index].mutate(&current);
            batch.truncate(self.per_call);
            if batch.is_empty() {
                continue;
            }
            let next = self.rng.random_range(0..batch.len());
            current = batch[next].clone();
            collected.extend(batch);
        }
        collected
    }

    pub fn apply_aggression(&mut self, scale: f64) {
        for mutator in &mut self.pool {
            mutator.apply_aggression(scale);
        }
    }

    pub fn clear_aggression(&mut self) {
        for mutator in &mut self.pool {
            mutator.clear_aggression();
        }
    }

    pub fn set_corpus(&mut self, corpus: &[Arc<[u8]>]) {
        for mutator in &mut self.pool {
            mutator.set_corpus(corpus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutators::{ArithMutator, BitFlipMutator};

    fn pool() -> Vec<Mutator> {
        vec![
            Mutator::BitFlip(BitFlipMutator::new(1)),
            Mutator::Arith(ArithMutator::new(2)),
        ]
    }

    #[test]
    fn empty_pool_yields_nothing() {
        let mut composite = CompositeMutator::new(1, Vec::new(), 4, 8);
        assert!(composite.mutate(b"data").is_empty());
    }

    #[test]
    fn output_is_bounded_by_calls_times_per_call() {
        let mut composite = CompositeMutator::new(1, pool(), 4, 8);
        let variants = composite.mutate(b"some input data");
        assert!(!variants.is_empty());
        assert!(variants.len() <= 4 * 8);
    }

    #[test]
    fn some_variant_differs_from_the_input() {
        let mut composite = CompositeMutator::new(9, pool(), 2, 4);
        let variants = composite.mutate(b"abcdefgh");
        assert!(variants.iter().any(|variant| variant != b"abcdefgh"));
    }
}
