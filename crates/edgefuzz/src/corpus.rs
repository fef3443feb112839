//! Corpus storage: candidates, the id arena, and the favored set.
//!
//! Candidates live in an id-keyed map and every other structure refers to
//! them by [`CandidateId`] only; there are no back-pointers.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use crate::coverage::Signature;

/// Monotonically assigned corpus entry id, starting at 1.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub struct CandidateId(pub u64);

/// Mutation-budget bounds for a corpus entry.
pub const ENERGY_MIN: u32 = 1;
pub const ENERGY_MAX: u32 = 20;

/// Exponential-moving-average weight for per-candidate execution time.
const EXEC_TIME_EMA_ALPHA: f64 = 0.3;

/// An input plus its scheduling statistics.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: CandidateId,
    /// The input bytes; immutable once stored.
    pub data: Arc<[u8]>,
    /// Mutation budget, always within [`ENERGY_MIN`]..=[`ENERGY_MAX`].
    pub energy: u32,
    /// Times this candidate was selected for mutation.
    pub cycles: u64,
    /// Exponential moving average of target wall time for this candidate.
    pub avg_exec_time: Duration,
    /// Times a run re-produced this candidate's coverage signature.
    pub hits: u64,
    /// Edges newly covered the last time this candidate was reported on.
    pub last_novelty: usize,
    /// Bitmap signature captured at admission; never changed afterwards.
    pub coverage_signature: Option<Signature>,
}

impl Candidate {
    fn new(id: CandidateId, data: Arc<[u8]>, energy: u32, signature: Option<Signature>) -> Self {
        Self {
            id,
            data,
            energy: energy.clamp(ENERGY_MIN, ENERGY_MAX),
            cycles: 0,
            avg_exec_time: Duration::ZERO,
            hits: 0,
            last_novelty: 0,
            coverage_signature: signature,
        }
    }

    /// Folds a fresh wall-time sample into the EMA (α = 0.3).
    pub fn note_exec_time(&mut self, wall_time: Duration) {
        if self.avg_exec_time.is_zero() {
            self.avg_exec_time = wall_time;
        } else {
            let updated = self.avg_exec_time.as_secs_f64() * (1.0 - EXEC_TIME_EMA_ALPHA)
                + wall_time.as_secs_f64() * EXEC_TIME_EMA_ALPHA;
            self.avg_exec_time = Duration::from_secs_f64(updated);
        }
    }

    pub fn set_energy(&mut self, energy: u32) {
        self.energy = energy.clamp(ENERGY_MIN, ENERGY_MAX);
    }
}

/// Id-keyed candidate arena plus the fallback round-robin queue.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: IndexMap<CandidateId, Candidate>,
    fallback: VecDeque<CandidateId>,
    next_id: u64,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores a new candidate and returns its id. Ids are never reused and
    /// entries are never destroyed within a run.
    pub fn insert(
        &mut self,
        data: Arc<[u8]>,
        energy: u32,
        signature: Option<Signature>,
    ) -> CandidateId {
        self.next_id += 1;
        let id = CandidateId(self.next_id);
        self.entries
            .insert(id, Candidate::new(id, data, energy, signature));
        self.fallback.push_back(id);
        id
    }

    pub fn get(&self, id: CandidateId) -> Option<&Candidate> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: CandidateId) -> Option<&mut Candidate> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: CandidateId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Candidate> {
        self.entries.values_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = CandidateId> + '_ {
        self.entries.keys().copied()
    }

    /// Signature-only duplicate lookup; byte equality is deliberately not
    /// consulted because identical bytes can produce different coverage.
    pub fn find_by_signature(&self, signature: Signature) -> Option<CandidateId> {
        self.entries
            .values()
            .find(|candidate| candidate.coverage_signature == Some(signature))
            .map(|candidate| candidate.id)
    }

    /// Rotates the fallback queue and returns the front id.
    pub fn next_round_robin(&mut self) -> Option<CandidateId> {
        let id = self.fallback.pop_front()?;
        self.fallback.push_back(id);
        Some(id)
    }

    pub fn shuffle_fallback<R: Rng>(&mut self, rng: &mut R) {
        let mut ids: Vec<CandidateId> = self.fallback.iter().copied().collect();
        ids.shuffle(rng);
        self.fallback = ids.into();
    }

    /// Snapshot of input bytes for donor-based mutators (havoc, splice).
    pub fn input_snapshot(&self, limit: usize) -> Vec<Arc<[u8]>> {
        self.entries
            .values()
            .take(limit)
            .map(|candidate| Arc::clone(&candidate.data))
            .collect()
    }
}

#[derive(Debug)]
struct FavoredEntry {
    since: Instant,
    reselections: u32,
}

/// Short-lived preference set for candidates that recently produced
/// novelty. Bounded in size, expired by TTL, and dropped after too many
/// re-selections while favored. Eviction is enforced lazily at the
/// scheduler's maintenance ticks.
#[derive(Debug)]
pub struct FavoredSet {
    entries: HashMap<CandidateId, FavoredEntry>,
    capacity: usize,
    ttl: Duration,
    max_reselections: u32,
}

impl FavoredSet {
    pub const DEFAULT_CAPACITY: usize = 20;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_RESELECTIONS: u32 = 8;

    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
            max_reselections: Self::DEFAULT_MAX_RESELECTIONS,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: CandidateId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = CandidateId> + '_ {
        self.entries.keys().copied()
    }

    /// Marks `id` favored, refreshing its timestamp if already present.
    pub fn mark(&mut self, id: CandidateId) {
        self.entries.insert(
            id,
            FavoredEntry {
                since: Instant::now(),
                reselections: 0,
            },
        );
    }

    /// Records a selection of a favored id; ids picked too often while
    /// favored lose the flag so they cannot monopolize the budget.
    pub fn note_selected(&mut self, id: CandidateId) {
        let expired = if let Some(entry) = self.entries.get_mut(&id) {
            entry.reselections += 1;
            entry.reselections >= self.max_reselections
        } else {
            false
        };
        if expired {
            self.entries.remove(&id);
        }
    }

    /// Drops entries older than the TTL.
    pub fn expire(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.duration_since(entry.since) < ttl);
    }

    /// Evicts the oldest entries until the set fits its capacity.
    pub fn enforce_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.since)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl Default for FavoredSet {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY, Self::DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(bytes: &[u8]) -> Arc<[u8]> {
        Arc::from(bytes)
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut corpus = Corpus::new();
        let first = corpus.insert(data(b"a"), 5, None);
        let second = corpus.insert(data(b"b"), 5, None);
        assert_eq!(first, CandidateId(1));
        assert_eq!(second, CandidateId(2));
        assert!(corpus.contains(first));
        assert!(corpus.contains(second));
    }

    #[test]
    fn energy_is_clamped_on_insert() {
        let mut corpus = Corpus::new();
        let id = corpus.insert(data(b"a"), 99, None);
        assert_eq!(corpus.get(id).unwrap().energy, ENERGY_MAX);
        let id = corpus.insert(data(b"b"), 0, None);
        assert_eq!(corpus.get(id).unwrap().energy, ENERGY_MIN);
    }

    #[test]
    fn exec_time_ema_tracks_samples() {
        let mut corpus = Corpus::new();
        let id = corpus.insert(data(b"a"), 5, None);
        let candidate = corpus.get_mut(id).unwrap();
        candidate.note_exec_time(Duration::from_millis(100));
        assert_eq!(candidate.avg_exec_time, Duration::from_millis(100));
        candidate.note_exec_time(Duration::from_millis(200));
        // 0.7 * 100ms + 0.3 * 200ms
        let expected = Duration::from_millis(130);
        let diff = candidate.avg_exec_time.abs_diff(expected);
        assert!(diff < Duration::from_millis(1));
    }

    #[test]
    fn round_robin_rotates() {
        let mut corpus = Corpus::new();
        let a = corpus.insert(data(b"a"), 5, None);
        let b = corpus.insert(data(b"b"), 5, None);
        assert_eq!(corpus.next_round_robin(), Some(a));
        assert_eq!(corpus.next_round_robin(), Some(b));
        assert_eq!(corpus.next_round_robin(), Some(a));
    }

    #[test]
    fn signature_lookup_ignores_bytes() {
        let mut corpus = Corpus::new();
        let sig = crate::coverage::CoverageMap::new().signature();
        let id = corpus.insert(data(b"a"), 5, Some(sig));
        // Same bytes, no signature: must not match.
        corpus.insert(data(b"a"), 5, None);
        assert_eq!(corpus.find_by_signature(sig), Some(id));
    }

    #[test]
    fn favored_capacity_is_enforced() {
        let mut favored = FavoredSet::new(2, Duration::from_secs(30));
        favored.mark(CandidateId(1));
        favored.mark(CandidateId(2));
        favored.mark(CandidateId(3));
        favored.enforce_capacity();
        assert!(favored.len() <= 2);
    }

    #[test]
    fn favored_expires_by_ttl() {
        let mut favored = FavoredSet::new(4, Duration::ZERO);
        favored.mark(CandidateId(1));
        favored.expire(Instant::now());
        assert!(favored.is_empty());
    }

    #[test]
    fn favored_drops_after_too_many_reselections() {
        let mut favored = FavoredSet::default();
        favored.mark(CandidateId(1));
        for _ in 0..FavoredSet::DEFAULT_MAX_RESELECTIONS {
            favored.note_selected(CandidateId(1));
        }
        assert!(!favored.contains(CandidateId(1)));
    }
}
