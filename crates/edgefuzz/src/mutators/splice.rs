//! Splice: recombines the current input with a corpus donor, preferring
//! donors that look least similar so the crossover actually mixes content.

use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Donor candidates examined per pick.
const DONOR_SAMPLE: usize = 4;

/// Splice attempts per invocation.
const DEFAULT_ATTEMPTS: usize = 8;

#[derive(Debug)]
pub struct SpliceMutator {
    rng: SmallRng,
    corpus: Vec<Arc<[u8]>>,
    attempts: usize,
    /// Split points are rounded down to a multiple of this.
    alignment: usize,
    min_len: usize,
    max_len: usize,
}

impl SpliceMutator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            corpus: Vec::new(),
            attempts: DEFAULT_ATTEMPTS,
            alignment: 1,
            min_len: 1,
            max_len: 1 << 16,
        }
    }

    pub fn with_limits(seed: u64, alignment: usize, min_len: usize, max_len: usize) -> Self {
        Self {
            alignment: alignment.max(1),
            min_len,
            max_len,
            ..Self::new(seed)
        }
    }

    pub fn set_corpus(&mut self, corpus: &[Arc<[u8]>]) {
        self.corpus = corpus.to_vec();
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if self.corpus.is_empty() {
            return Vec::new();
        }
        let mut variants = Vec::new();
        for _ in 0..self.attempts {
            let Some(donor) = self.pick_donor(data) else {
                continue;
            };
            let variant = self.splice_once(data, &donor);
            if (self.min_len..=self.max_len).contains(&variant.len()) {
                variants.push(variant);
            }
        }
        variants
    }

    /// Samples a few donors and keeps the one least similar to the input,
    /// where similarity is the common-prefix ratio.
    fn pick_donor(&mut self, data: &[u8]) -> Option<Arc<[u8]>> {
        let mut best: Option<(f64, Arc<[u8]>)> = None;
        for _ in 0..DONOR_SAMPLE {
            let donor = &self.corpus[self.rng.random_range(0..self.corpus.len())];
            if donor.is_empty() || donor.as_ref() == data {
                continue;
            }
            let similarity = common_prefix_ratio(data, donor);
            match &best {
                Some((least, _)) if similarity >= *least => {}
                _ => best = Some((similarity, Arc::clone(donor))),
            }
        }
        best.map(|(_, donor)| donor)
    }

    fn splice_once(&mut self, data: &[u8], donor: &[u8]) -> Vec<u8> {
        let own_split = self.aligned_split(data.len());
        let donor_split = self.aligned_split(donor.len());
        match self.rng.random_range(0..4u8) {
            // Own prefix + donor suffix.
            0 => [&data[..own_split], &donor[donor_split..]].concat(),
            // Keep the whole prefix and append the donor wholesale.
            1 => [&data[..own_split], donor].concat(),
            // Append a donor suffix.
            2 => [data, &donor[donor_split..]].concat(),
            // Crossover: swap middles.
            _ => {
                let own_second = self.aligned_split(data.len()).max(own_split);
                [
                    &data[..own_split],
                    &donor[donor_split..],
                    &data[own_second..],
                ]
                .concat()
            }
        }
    }

    fn aligned_split(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let raw = self.rng.random_range(0..=len);
        let aligned = raw - raw % self.alignment;
        aligned.min(len)
    }
}

fn common_prefix_ratio(a: &[u8], b: &[u8]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let prefix = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    prefix as f64 / longest as f64
}
