//! Adaptive video quality target with hysteresis (spec §4.2).
//!
//! Two tiers only — this is the room-wide *target* signaled to every
//! publisher via `setVideoQuality`, distinct from any per-producer
//! encoding tier the media engine might additionally apply.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    #[default]
    Standard,
}

/// Apply the hysteresis rule from spec §4.2:
///
/// - `standard -> low` once `participant_count >= low_threshold`.
/// - `low -> standard` once `participant_count <= standard_threshold`.
/// - otherwise unchanged.
///
/// Callers must ensure `standard_threshold < low_threshold`
/// ([`crate::config::Config::from_env`] enforces this at startup) so the
/// two transitions can never both fire for the same count.
#[must_use]
pub fn next_quality(current: Quality, participant_count: usize, low_threshold: usize, standard_threshold: usize) -> Quality {
    match current {
        Quality::Standard if participant_count >= low_threshold => Quality::Low,
        Quality::Low if participant_count <= standard_threshold => Quality::Standard,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOW: usize = 10;
    const STANDARD: usize = 7;

    #[test]
    fn stays_standard_below_low_threshold() {
        assert_eq!(next_quality(Quality::Standard, 9, LOW, STANDARD), Quality::Standard);
    }

    #[test]
    fn downgrades_at_low_threshold() {
        assert_eq!(next_quality(Quality::Standard, 10, LOW, STANDARD), Quality::Low);
    }

    #[test]
    fn stays_low_above_standard_threshold() {
        assert_eq!(next_quality(Quality::Low, 8, LOW, STANDARD), Quality::Low);
    }

    #[test]
    fn upgrades_at_standard_threshold() {
        assert_eq!(next_quality(Quality::Low, 7, LOW, STANDARD), Quality::Standard);
    }

    #[test]
    fn no_flapping_in_the_gap() {
        // Between standard_threshold and low_threshold, whichever tier we
        // were already in is sticky.
        for count in (STANDARD + 1)..LOW {
            assert_eq!(next_quality(Quality::Standard, count, LOW, STANDARD), Quality::Standard);
            assert_eq!(next_quality(Quality::Low, count, LOW, STANDARD), Quality::Low);
        }
    }
}
