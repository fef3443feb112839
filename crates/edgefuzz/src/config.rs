//! Campaign configuration.
//!
//! Everything tunable lives in one explicit [`Config`] value handed to the
//! campaign; a handful of knobs can additionally be overridden through
//! environment variables and are re-read once per outer loop iteration, so
//! they can be adjusted while a campaign is running.

use std::{env, time::Duration};

use crate::{
    aggression::AggressionConfig,
    coverage::MAP_SIZE,
    execution::InputMode,
    monitor::DEFAULT_NOVELTY_THRESHOLD,
    scheduler::SchedulerConfig,
};

/// Environment variables honored by [`Config::refresh_from_env`], with
/// their defaults.
pub mod env_keys {
    /// Probability of routing an attempt through a composite mutator
    /// (default 0.10).
    pub const COMPOSITE_PROB: &str = "EDGEFUZZ_COMPOSITE_PROB";
    /// Composite probability while coverage growth is slow (default 0.25).
    pub const COMPOSITE_PROB_SLOW: &str = "EDGEFUZZ_COMPOSITE_PROB_SLOW";
    /// Maximum chained mutator calls per composite (default 4).
    pub const COMPOSITE_MAX_CALLS: &str = "EDGEFUZZ_COMPOSITE_MAX_CALLS";
    /// Variants kept per composite call (default 8).
    pub const COMPOSITE_PER_CALL: &str = "EDGEFUZZ_COMPOSITE_PER_CALL";
    /// Set to `0` or `false` to let the PNG mutator use its destructive
    /// strategies (default on).
    pub const PNG_SAFE: &str = "EDGEFUZZ_PNG_SAFE";
}

#[derive(Debug, Clone)]
pub struct Config {
    pub map_size: usize,
    pub input_mode: InputMode,
    /// Per-run target timeout.
    pub run_timeout: Duration,
    /// Total campaign duration.
    pub runtime: Duration,
    /// Status reporter period; `None` disables the reporter.
    pub status_interval: Option<Duration>,
    /// Upper bound on mutation attempts per selection (energy is clamped
    /// into this).
    pub max_attempts: u32,
    /// Variants consumed from each generator batch.
    pub max_variants: usize,
    pub composite_probability: f64,
    pub composite_probability_slow: f64,
    pub composite_max_calls: usize,
    pub composite_per_call: usize,
    /// Probability of preferring the specialized mutator under the normal
    /// policy (and the basic set under the slow policy).
    pub specialized_bias: f64,
    pub novelty_threshold: usize,
    /// Donor inputs handed to corpus-aware mutators.
    pub corpus_snapshot_limit: usize,
    /// Master seed for all RNGs.
    pub random_seed: u64,
    pub png_safe_mode: bool,
    pub scheduler: SchedulerConfig,
    pub aggression: AggressionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            map_size: MAP_SIZE,
            input_mode: InputMode::Stdin,
            run_timeout: Duration::from_secs(1),
            runtime: Duration::from_secs(3600),
            status_interval: Some(Duration::from_secs(5)),
            max_attempts: 8,
            max_variants: 4,
            composite_probability: 0.10,
            composite_probability_slow: 0.25,
            composite_max_calls: 4,
            composite_per_call: 8,
            specialized_bias: 0.7,
            novelty_threshold: DEFAULT_NOVELTY_THRESHOLD,
            corpus_snapshot_limit: 64,
            random_seed: 0,
            png_safe_mode: true,
            scheduler: SchedulerConfig::default(),
            aggression: AggressionConfig::default(),
        }
    }
}

impl Config {
    /// Re-reads the environment-tunable fields. Invalid values are ignored
    /// and the current setting is kept.
    pub fn refresh_from_env(&mut self) {
        if let Some(value) = read_env::<f64>(env_keys::COMPOSITE_PROB) {
            self.composite_probability = value.clamp(0.0, 1.0);
        }
        if let Some(value) = read_env::<f64>(env_keys::COMPOSITE_PROB_SLOW) {
            self.composite_probability_slow = value.clamp(0.0, 1.0);
        }
        if let Some(value) = read_env::<usize>(env_keys::COMPOSITE_MAX_CALLS) {
            self.composite_max_calls = value.max(1);
        }
        if let Some(value) = read_env::<usize>(env_keys::COMPOSITE_PER_CALL) {
            self.composite_per_call = value.max(1);
        }
        if let Ok(value) = env::var(env_keys::PNG_SAFE) {
            self.png_safe_mode = !matches!(value.as_str(), "0" | "false" | "False");
        }
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.map_size, MAP_SIZE);
        assert!(config.composite_probability < config.composite_probability_slow);
        assert_eq!(config.max_attempts, 8);
        assert!(config.png_safe_mode);
    }

    #[test]
    fn env_overrides_are_applied_and_validated() {
        let mut config = Config::default();
        // Env mutation is process-global; restrict this test to one key to
        // keep it independent of sibling tests.
        unsafe {
            env::set_var(env_keys::COMPOSITE_MAX_CALLS, "7");
        }
        config.refresh_from_env();
        assert_eq!(config.composite_max_calls, 7);

        unsafe {
            env::set_var(env_keys::COMPOSITE_MAX_CALLS, "not a number");
        }
        config.refresh_from_env();
        assert_eq!(config.composite_max_calls, 7);

        unsafe {
            env::remove_var(env_keys::COMPOSITE_MAX_CALLS);
        }
    }
}
