//! Corpus scheduling: admission, weighted selection, energy decay, and
//! stagnation detection.
//!
//! Admission matches runs against existing entries by coverage signature
//! only; byte equality is deliberately not used because the same bytes can
//! produce different coverage across executions.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use itertools::Itertools;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tracing::{debug, trace};

use crate::{
    corpus::{Candidate, CandidateId, Corpus, ENERGY_MAX, FavoredSet},
    execution::{RunResult, RunStatus},
    utils,
};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Initial energy for imported seeds.
    pub seed_energy: u32,
    /// Probability of admitting a non-novel `ok` variant for exploration.
    pub exploration_admission: f64,
    /// Fraction of selections taken from the low-`cycles` explore pool.
    pub explore_fraction: f64,
    /// Explore fraction while coverage growth is stagnating.
    pub explore_fraction_stagnation: f64,
    /// Size of the low-`cycles` explore pool.
    pub explore_pool_size: usize,
    /// Explore pool size while stagnating.
    pub explore_pool_size_stagnation: usize,
    /// Probability of restricting selection to the favored set.
    pub favored_bias: f64,
    /// Selections between maintenance passes.
    pub maintenance_interval: u64,
    /// Seconds between stagnation checks.
    pub stagnation_check_interval: Duration,
    /// Fractional cumulative-coverage growth at or below which the
    /// scheduler flips into stagnation mode.
    pub stagnation_growth_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            seed_energy: 5,
            exploration_admission: 0.01,
            explore_fraction: 0.15,
            explore_fraction_stagnation: 0.30,
            explore_pool_size: 8,
            explore_pool_size_stagnation: 32,
            favored_bias: 0.65,
            maintenance_interval: 200,
            stagnation_check_interval: Duration::from_secs(10),
            stagnation_growth_threshold: 0.01,
        }
    }
}

#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    corpus: Corpus,
    favored: FavoredSet,
    rng: SmallRng,
    selections: u64,
    stagnating: bool,
    last_stagnation_check: Instant,
    coverage_at_last_check: usize,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, seed: u64) -> Self {
        Self {
            config,
            corpus: Corpus::new(),
            favored: FavoredSet::default(),
            rng: SmallRng::seed_from_u64(seed),
            selections: 0,
            stagnating: false,
            last_stagnation_check: Instant::now(),
            coverage_at_last_check: 0,
        }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.len()
    }

    pub fn is_stagnating(&self) -> bool {
        self.stagnating
    }

    pub fn favored_len(&self) -> usize {
        self.favored.len()
    }

    /// Imports one seed verbatim.
    pub fn add_seed(&mut self, data: Vec<u8>) -> CandidateId {
        self.corpus
            .insert(Arc::from(data), self.config.seed_energy, None)
    }

    /// Donor inputs for corpus-aware mutators.
    pub fn input_snapshot(&self, limit: usize) -> Vec<Arc<[u8]>> {
        self.corpus.input_snapshot(limit)
    }

    /// Picks the next candidate to mutate and bumps its selection stats.
    pub fn next_candidate(&mut self) -> Option<Candidate> {
        if self.corpus.is_empty() {
            return None;
        }
        self.selections += 1;
        if self.selections % self.config.maintenance_interval == 0 {
            self.run_maintenance();
        }

        let id = if self.corpus.len() <= 2 {
            self.corpus.next_round_robin()?
        } else {
            let explore_fraction = if self.stagnating {
                self.config.explore_fraction_stagnation
            } else {
                self.config.explore_fraction
            };
            if self.rng.random_bool(explore_fraction) {
                self.pick_from_explore_pool()
            } else {
                self.pick_weighted()
            }
        };

        // A returned id not present in the corpus is a programmer error:
        // entries are never removed within a run.
        let candidate = self
            .corpus
            .get_mut(id)
            .expect("scheduler selected an id that is not in the corpus");
        candidate.cycles += 1;
        let snapshot = candidate.clone();
        if self.favored.contains(id) {
            self.favored.note_selected(id);
        }
        trace!(%id, cycles = snapshot.cycles, energy = snapshot.energy, "Selected candidate");
        Some(snapshot)
    }

    /// Uniform pick among the candidates with the fewest selections.
    fn pick_from_explore_pool(&mut self) -> CandidateId {
        let pool_size = if self.stagnating {
            self.config.explore_pool_size_stagnation
        } else {
            self.config.explore_pool_size
        };
        let pool: Vec<CandidateId> = self
            .corpus
            .iter()
            .map(|candidate| (candidate.cycles, candidate.id))
            .sorted_unstable()
            .take(pool_size.max(1))
            .map(|(_, id)| id)
            .collect();
        pool[self.rng.random_range(0..pool.len())]
    }

    /// Score-weighted pick, biased toward the favored pool when non-empty.
    fn pick_weighted(&mut self) -> CandidateId {
        let mut pool: Vec<CandidateId> = if !self.favored.is_empty()
            && self.rng.random_bool(self.config.favored_bias)
        {
            self.favored
                .ids()
                .filter(|id| self.corpus.contains(*id))
                .collect()
        } else {
            Vec::new()
        };
        if pool.is_empty() {
            pool = self.corpus.ids().collect();
        }

        let weights: Vec<f64> = pool
            .iter()
            .map(|id| {
                let candidate = self.corpus.get(*id).expect("pool ids come from the corpus");
                score(candidate, &mut self.rng)
            })
            .collect();
        pool[utils::weighted_index(&mut self.rng, &weights)]
    }

    /// Periodic upkeep: queue shuffle, favored expiry and bounding, and the
    /// differential energy decay.
    fn run_maintenance(&mut self) {
        self.corpus.shuffle_fallback(&mut self.rng);
        self.favored.expire(Instant::now());
        self.favored.enforce_capacity();
        for candidate in self.corpus.iter_mut() {
            let factor = if candidate.last_novelty == 0 { 0.8 } else { 0.95 };
            let decayed = (candidate.energy as f64 * factor).round() as u32;
            candidate.set_energy(decayed);
        }
        trace!(
            corpus = self.corpus.len(),
            favored = self.favored.len(),
            "Scheduler maintenance"
        );
    }

    /// Feeds a run outcome back into the corpus.
    ///
    /// `novelty` is the edge delta the monitor computed when it merged the
    /// run's bitmap (the `record_run` for a variant always happens before
    /// its `report_result`).
    pub fn report_result(&mut self, sample: &[u8], result: &RunResult, novelty: usize) {
        let signature = result.coverage.as_ref().map(|map| map.signature());

        if let Some(signature) = signature
            && let Some(id) = self.corpus.find_by_signature(signature)
        {
            let candidate = self
                .corpus
                .get_mut(id)
                .expect("signature lookup returned a corpus id");
            candidate.note_exec_time(result.wall_time);
            candidate.hits += 1;
            candidate.last_novelty = novelty;
            match result.status {
                // Crash/hang reproducers must not soak up the budget.
                RunStatus::Crash | RunStatus::Hang => {
                    candidate.set_energy(candidate.energy.clamp(1, 3));
                }
                _ => {
                    if novelty > 0 {
                        candidate.set_energy(candidate.energy + 2 + novelty as u32);
                        self.favored.mark(id);
                    }
                }
            }
            return;
        }

        // Crash and hang variants are never admitted to the corpus.
        if result.status != RunStatus::Ok {
            return;
        }

        if novelty > 0 {
            let energy = (1 + 3 * novelty as u32).clamp(6, ENERGY_MAX);
            let id = self.admit(sample, energy, signature, result, novelty);
            self.favored.mark(id);
            debug!(%id, novelty, energy, "Admitted novel candidate");
        } else if self.rng.random_bool(self.config.exploration_admission) {
            // Exploration-only admission, with or without coverage.
            let id = self.admit(sample, 1, signature, result, novelty);
            debug!(%id, "Admitted exploration candidate");
        }
    }

    fn admit(
        &mut self,
        sample: &[u8],
        energy: u32,
        signature: Option<crate::coverage::Signature>,
        result: &RunResult,
        novelty: usize,
    ) -> CandidateId {
        let id = self.corpus.insert(Arc::from(sample), energy, signature);
        let candidate = self
            .corpus
            .get_mut(id)
            .expect("freshly inserted id is present");
        candidate.note_exec_time(result.wall_time);
        candidate.last_novelty = novelty;
        id
    }

    /// Stagnation detector, rate-limited to the configured interval: flips
    /// on when fractional cumulative-coverage growth since the previous
    /// check drops to the threshold or below.
    pub fn note_cumulative_coverage(&mut self, cumulative: usize) {
        if self.last_stagnation_check.elapsed() < self.config.stagnation_check_interval {
            return;
        }
        let baseline = self.coverage_at_last_check.max(1);
        let growth = cumulative.saturating_sub(self.coverage_at_last_check) as f64 / baseline as f64;
        let stagnating = growth <= self.config.stagnation_growth_threshold;
        if stagnating != self.stagnating {
            debug!(stagnating, growth, "Stagnation state changed");
        }
        self.stagnating = stagnating;
        self.coverage_at_last_check = cumulative;
        self.last_stagnation_check = Instant::now();
    }
}

/// Selection score: favors small, fast, recently novel, re-hit candidates
/// and penalizes those already mutated many times.
fn score<R: Rng>(candidate: &Candidate, rng: &mut R) -> f64 {
    let mut score = 100.0;
    score += match candidate.data.len() {
        0..=16 => 40.0,
        17..=64 => 20.0,
        65..=256 => 5.0,
        _ => 0.0,
    };
    let avg_ms = candidate.avg_exec_time.as_secs_f64() * 1000.0;
    score += (100.0 / (avg_ms + 1.0)).clamp(0.0, 50.0);
    score -= (1.5 * candidate.cycles as f64).min(60.0);
    score += (2.0 * candidate.hits as f64).min(40.0);
    score += (5.0 * candidate.last_novelty as f64).min(200.0);
    score *= 1.0 + 0.05 * (1.0 + f64::from(candidate.energy.min(100))).ln();
    score *= 1.0 + rng.random_range(-0.01..=0.01);
    score.max(1.0)
}
