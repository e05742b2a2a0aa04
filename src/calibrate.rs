use rand::Rng;

use crate::config::EngineConfig;
use crate::model::{CharacterProfile, ContentFilter, Tier, MAX_TIER, MIN_TIER};

/// Score below which the user gets remedial content one tier down.
pub const REMEDIAL_THRESHOLD: f64 = 0.4;
/// Score above which a stretch tier one up becomes a candidate.
pub const STRETCH_THRESHOLD: f64 = 0.85;

/// Band lookup on elapsed days. Tier never drops below what the band implies;
/// the remedial adjustment in `calibrate` is the only thing that serves lower.
pub fn base_tier(elapsed_days: i64) -> Tier {
    match elapsed_days {
        i64::MIN..=7 => 1,
        8..=30 => 2,
        31..=60 => 3,
        _ => 4,
    }
}

/// Rolling average of the most recent scores, newest slice already selected
/// by the caller. `None` when there is no history to average.
pub fn rolling_average(recent_scores: &[f64]) -> Option<f64> {
    if recent_scores.is_empty() {
        return None;
    }
    Some(recent_scores.iter().sum::<f64>() / recent_scores.len() as f64)
}

/// Derive the targeting contract for a user: band tier adjusted by recent
/// performance, plus the profile's content fields.
///
/// Struggling users (rolling average < 0.4) are capped one tier down, floored
/// at 1. Users cruising above 0.85 are offered the next tier up, but only
/// probabilistically so one hot streak does not over-fit the difficulty.
pub fn calibrate<R: Rng>(
    elapsed_days: i64,
    profile: &CharacterProfile,
    recent_scores: &[f64],
    config: &EngineConfig,
    rng: &mut R,
) -> ContentFilter {
    let base = base_tier(elapsed_days);
    let tier = match rolling_average(recent_scores) {
        Some(avg) if avg < REMEDIAL_THRESHOLD => base.saturating_sub(1).max(MIN_TIER),
        Some(avg) if avg > STRETCH_THRESHOLD && base < MAX_TIER => {
            if rng.gen_bool(config.stretch_probability) {
                base + 1
            } else {
                base
            }
        }
        _ => base,
    };
    ContentFilter::from_profile(tier, profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn profile() -> CharacterProfile {
        CharacterProfile::new("u1", "new-york", "25-34", "female")
    }

    #[test]
    fn test_band_boundaries() {
        for day in 0..8 {
            assert_eq!(base_tier(day), 1, "day {}", day);
        }
        assert_eq!(base_tier(8), 2);
        assert_eq!(base_tier(30), 2);
        assert_eq!(base_tier(31), 3);
        assert_eq!(base_tier(60), 3);
        assert_eq!(base_tier(61), 4);
        assert_eq!(base_tier(365), 4);
    }

    #[test]
    fn test_no_history_uses_base_tier() {
        let mut rng = StdRng::seed_from_u64(1);
        let filter = calibrate(20, &profile(), &[], &EngineConfig::default(), &mut rng);
        assert_eq!(filter.tier, 2);
        assert_eq!(filter.location.as_deref(), Some("new-york"));
        assert_eq!(filter.age_group.as_deref(), Some("25-34"));
        assert_eq!(filter.gender.as_deref(), Some("female"));
    }

    #[test]
    fn test_remedial_cap_never_above_base_minus_one() {
        let mut rng = StdRng::seed_from_u64(1);
        let scores = [0.2, 0.2, 0.2, 0.2, 0.2];
        for (days, expected) in [(3, 1), (20, 1), (45, 2), (90, 3)] {
            let filter = calibrate(days, &profile(), &scores, &EngineConfig::default(), &mut rng);
            assert_eq!(filter.tier, expected, "elapsed {}", days);
        }
    }

    #[test]
    fn test_remedial_floors_at_tier_one() {
        let mut rng = StdRng::seed_from_u64(1);
        let filter = calibrate(2, &profile(), &[0.1], &EngineConfig::default(), &mut rng);
        assert_eq!(filter.tier, 1);
    }

    #[test]
    fn test_stretch_is_probabilistic() {
        let scores = [0.9, 0.95, 0.9, 1.0, 0.9];
        let config = EngineConfig::default();
        let mut seen = std::collections::HashSet::new();
        for seed in 0..64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let filter = calibrate(10, &profile(), &scores, &config, &mut rng);
            assert!(filter.tier == 2 || filter.tier == 3);
            seen.insert(filter.tier);
        }
        // With 64 seeds at p = 0.3 both outcomes show up.
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_stretch_pinned_by_probability() {
        let scores = [0.9; 5];
        let mut rng = StdRng::seed_from_u64(1);

        let mut always = EngineConfig::default();
        always.stretch_probability = 1.0;
        assert_eq!(calibrate(10, &profile(), &scores, &always, &mut rng).tier, 3);

        let mut never = EngineConfig::default();
        never.stretch_probability = 0.0;
        assert_eq!(calibrate(10, &profile(), &scores, &never, &mut rng).tier, 2);
    }

    #[test]
    fn test_no_stretch_past_max_tier() {
        let mut config = EngineConfig::default();
        config.stretch_probability = 1.0;
        let mut rng = StdRng::seed_from_u64(1);
        let filter = calibrate(200, &profile(), &[1.0; 5], &config, &mut rng);
        assert_eq!(filter.tier, 4);
    }

    #[test]
    fn test_mid_band_scores_leave_tier_alone() {
        let mut rng = StdRng::seed_from_u64(1);
        let filter = calibrate(40, &profile(), &[0.5, 0.6, 0.7], &EngineConfig::default(), &mut rng);
        assert_eq!(filter.tier, 3);
    }

    #[test]
    fn test_empty_profile_fields_become_any() {
        let mut rng = StdRng::seed_from_u64(1);
        let profile = CharacterProfile::new("u1", "", "", "");
        let filter = calibrate(1, &profile, &[], &EngineConfig::default(), &mut rng);
        assert_eq!(filter.location, None);
        assert_eq!(filter.age_group, None);
        assert_eq!(filter.gender, None);
    }
}
