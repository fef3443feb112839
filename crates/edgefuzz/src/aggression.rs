//! Hysteretic aggression mode for the mutation pipeline.
//!
//! When coverage growth stalls, the campaign widens mutator parameters by a
//! scale factor. The state machine enforces a cooldown after each episode
//! and a minimum duration inside one, so the mutators are not re-tuned on
//! every noisy growth sample.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct AggressionConfig {
    /// Factor by which mutator parameters are widened while aggressive.
    pub scale: f64,
    /// Minimum time spent aggressive before an exit is allowed.
    pub min_duration: Duration,
    /// After an exit, no re-entry for this long.
    pub cooldown: Duration,
}

impl Default for AggressionConfig {
    fn default() -> Self {
        Self {
            scale: 2.0,
            min_duration: Duration::from_secs(15),
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct AggressionManager {
    config: AggressionConfig,
    aggressive: bool,
    last_enter: Option<Instant>,
    last_exit: Option<Instant>,
}

impl AggressionManager {
    pub fn new(config: AggressionConfig) -> Self {
        Self {
            config,
            aggressive: false,
            last_enter: None,
            last_exit: None,
        }
    }

    /// Feeds the latest slow-growth observation. Returns `true` when the
    /// aggressive state flipped, so the caller knows to re-tune mutators.
    pub fn update(&mut self, slow_growth: bool) -> bool {
        let now = Instant::now();
        if slow_growth && !self.aggressive {
            let cooled_down = self
                .last_exit
                .is_none_or(|exit| now.duration_since(exit) >= self.config.cooldown);
            if cooled_down {
                self.aggressive = true;
                self.last_enter = Some(now);
                return true;
            }
        } else if !slow_growth
            && self.aggressive
            && let Some(entered) = self.last_enter
            && now.duration_since(entered) >= self.config.min_duration
        {
            self.aggressive = false;
            self.last_exit = Some(now);
            return true;
        }
        false
    }

    pub fn is_aggressive(&self) -> bool {
        self.aggressive
    }

    /// The scale mutators should apply right now (1.0 when not aggressive).
    pub fn scale(&self) -> f64 {
        if self.aggressive { self.config.scale } else { 1.0 }
    }
}

impl Default for AggressionManager {
    fn default() -> Self {
        Self::new(AggressionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_config() -> AggressionConfig {
        AggressionConfig {
            scale: 3.0,
            min_duration: Duration::ZERO,
            cooldown: Duration::ZERO,
        }
    }

    #[test]
    fn enters_on_first_slow_signal() {
        let mut manager = AggressionManager::default();
        assert!(!manager.is_aggressive());
        assert!(manager.update(true));
        assert!(manager.is_aggressive());
        assert_eq!(manager.scale(), 2.0);
    }

    #[test]
    fn holds_for_minimum_duration() {
        let mut manager = AggressionManager::new(AggressionConfig {
            min_duration: Duration::from_secs(3600),
            ..AggressionConfig::default()
        });
        assert!(manager.update(true));
        // Growth recovered, but the minimum duration has not elapsed.
        assert!(!manager.update(false));
        assert!(manager.is_aggressive());
    }

    #[test]
    fn cooldown_blocks_reentry() {
        let mut manager = AggressionManager::new(AggressionConfig {
            min_duration: Duration::ZERO,
            cooldown: Duration::from_secs(3600),
            ..AggressionConfig::default()
        });
        assert!(manager.update(true));
        assert!(manager.update(false));
        // Still cooling down: the slow signal is ignored.
        assert!(!manager.update(true));
        assert!(!manager.is_aggressive());
    }

    #[test]
    fn full_cycle_with_instant_thresholds() {
        let mut manager = AggressionManager::new(instant_config());
        assert!(manager.update(true));
        assert_eq!(manager.scale(), 3.0);
        assert!(manager.update(false));
        assert_eq!(manager.scale(), 1.0);
        assert!(manager.update(true));
        assert!(manager.is_aggressive());
    }

    #[test]
    fn repeated_signals_do_not_reflip() {
        let mut manager = AggressionManager::new(instant_config());
        assert!(manager.update(true));
        assert!(!manager.update(true));
        assert!(manager.is_aggressive());
    }
}
