#![allow(dead_code, reason = "This is an utility module.")]

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Seconds since the Unix epoch as a float, the timestamp unit used
/// throughout the monitor journal.
pub(crate) fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Milliseconds since the Unix epoch, used for artifact file names.
pub(crate) fn unix_time_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Picks an index proportionally to `weights`. Zero-weight entries are never
/// selected; an all-zero table falls back to index 0.
pub(crate) fn weighted_index<R: Rng>(rng: &mut R, weights: &[f64]) -> usize {
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if total <= 0.0 {
        return 0;
    }
    let mut roll = rng.random_range(0.0..total);
    for (idx, weight) in weights.iter().enumerate() {
        if !weight.is_finite() || *weight <= 0.0 {
            continue;
        }
        if roll < *weight {
            return idx;
        }
        roll -= *weight;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    #[test]
    fn weighted_index_skips_zero_weights() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..256 {
            let idx = weighted_index(&mut rng, &[0.0, 3.0, 0.0, 1.0]);
            assert!(idx == 1 || idx == 3);
        }
    }

    #[test]
    fn weighted_index_all_zero_falls_back() {
        let mut rng = SmallRng::seed_from_u64(7);
        assert_eq!(weighted_index(&mut rng, &[0.0, 0.0]), 0);
    }
}
