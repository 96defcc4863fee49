//! Pure stake mathematics.
//!
//! All arithmetic is integer and every division truncates toward zero. The
//! rounding loss of a reward distribution is sunk into the accumulator and is
//! bounded per user per sync by one `REWARD_PER_WEIGHT_MULT` unit; tests pin
//! this.

use crate::{GranaryError, Result, Timestamp};

/// Unit weight of an unlocked stake of value 1.
pub const WEIGHT_MULT: u128 = 1_000_000;

/// Scale of the global reward accumulators.
pub const REWARD_PER_WEIGHT_MULT: u128 = 1_000_000_000_000;

/// Multiplier applied when the engine itself creates a locked compounding
/// stake out of a claimed reward.
pub const YEAR_WEIGHT_MULT: u128 = 2 * WEIGHT_MULT;

/// Maximum lock duration, in seconds (730 days).
pub const MAX_LOCK: Timestamp = 730 * 24 * 60 * 60;

/// Legacy-stake bonus factor.
pub const V1_BONUS: u128 = 2;

/// Legacy weight translation ratio, applied together with [`V1_BONUS`].
pub const V1_TO_V2_NUMERATOR: u128 = 1500;
pub const V1_TO_V2_DENOMINATOR: u128 = 1000;

/// Geometric emission decay applied every `seconds_per_update`: 3% per step.
pub const RATIO_DECAY_NUMERATOR: u128 = 97;
pub const RATIO_DECAY_DENOMINATOR: u128 = 100;

pub fn add_u128(a: u128, b: u128, ctx: &'static str) -> Result<u128> {
    a.checked_add(b).ok_or(GranaryError::Overflow(ctx))
}

pub fn sub_u128(a: u128, b: u128, ctx: &'static str) -> Result<u128> {
    a.checked_sub(b).ok_or(GranaryError::Underflow(ctx))
}

pub fn mul_u128(a: u128, b: u128, ctx: &'static str) -> Result<u128> {
    a.checked_mul(b).ok_or(GranaryError::Overflow(ctx))
}

pub fn mul_div_floor_u128(a: u128, b: u128, denom: u128, ctx: &'static str) -> Result<u128> {
    if denom == 0 {
        return Err(GranaryError::Overflow(ctx));
    }
    Ok(mul_u128(a, b, ctx)? / denom)
}

/// Weight multiplier of a lock interval, in `WEIGHT_MULT` units.
///
/// A flexible stake (`locked_from == locked_until == 0`) gets exactly
/// `WEIGHT_MULT`; the full `MAX_LOCK` interval gets exactly `2 * WEIGHT_MULT`.
pub fn lock_multiplier(locked_from: Timestamp, locked_until: Timestamp) -> Result<u128> {
    if locked_until < locked_from {
        return Err(GranaryError::InvalidLock);
    }
    let duration = (locked_until - locked_from) as u128;
    add_u128(
        mul_div_floor_u128(duration, WEIGHT_MULT, MAX_LOCK as u128, "lock_multiplier")?,
        WEIGHT_MULT,
        "lock_multiplier",
    )
}

/// Weight of a stake of `value` locked over `[locked_from, locked_until]`.
///
/// Linear in `value`: the multiplier is computed first, so partial unstakes
/// remove exactly `multiplier * removed_value` weight.
pub fn lock_weight(value: u128, locked_from: Timestamp, locked_until: Timestamp) -> Result<u128> {
    mul_u128(lock_multiplier(locked_from, locked_until)?, value, "lock_weight")
}

/// Converts a weight into the reward it has earned under accumulator `rpw`.
pub fn weight_to_reward(weight: u128, rewards_per_weight: u128) -> Result<u128> {
    mul_div_floor_u128(
        weight,
        rewards_per_weight,
        REWARD_PER_WEIGHT_MULT,
        "weight_to_reward",
    )
}

/// Converts a reward into accumulator units over `global_weight`.
///
/// Preconditions:
/// - `global_weight > 0` (callers must never distribute into an empty pool).
pub fn reward_per_weight(reward: u128, global_weight: u128) -> Result<u128> {
    if global_weight == 0 {
        return Err(GranaryError::NoActiveWeight);
    }
    mul_div_floor_u128(
        reward,
        REWARD_PER_WEIGHT_MULT,
        global_weight,
        "reward_per_weight",
    )
}

/// Translates a legacy (v1) stake weight into its bonus-adjusted v2 weight:
/// `w * V1_BONUS * 1500 / 1000`.
pub fn v1_to_v2_weight(weight: u128) -> Result<u128> {
    mul_div_floor_u128(
        mul_u128(weight, V1_BONUS, "v1_to_v2_weight")?,
        V1_TO_V2_NUMERATOR,
        V1_TO_V2_DENOMINATOR,
        "v1_to_v2_weight",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flexible_multiplier_is_unit() {
        assert_eq!(lock_multiplier(0, 0).unwrap(), WEIGHT_MULT);
    }

    #[test]
    fn max_lock_multiplier_is_double() {
        assert_eq!(lock_multiplier(1_000, 1_000 + MAX_LOCK).unwrap(), 2 * WEIGHT_MULT);
    }

    #[test]
    fn half_lock_multiplier() {
        let m = lock_multiplier(0, MAX_LOCK / 2).unwrap();
        assert_eq!(m, WEIGHT_MULT / 2 + WEIGHT_MULT);
    }

    #[test]
    fn short_interval_truncates_to_unit() {
        // 11 seconds over 730 days rounds down to zero extra weight.
        assert_eq!(lock_multiplier(0, 11).unwrap(), WEIGHT_MULT);
    }

    #[test]
    fn inverted_interval_rejected() {
        assert_eq!(lock_multiplier(10, 5), Err(GranaryError::InvalidLock));
    }

    #[test]
    fn v1_translation_is_three_halves_of_double() {
        assert_eq!(v1_to_v2_weight(4_000_000).unwrap(), 12_000_000);
        assert_eq!(v1_to_v2_weight(0).unwrap(), 0);
    }

    #[test]
    fn reward_per_weight_rejects_empty_pool() {
        assert_eq!(reward_per_weight(1, 0), Err(GranaryError::NoActiveWeight));
    }

    #[test]
    fn weight_reward_round_trip_loses_at_most_truncation() {
        let gw = 10_010_000_000u128;
        let reward = 150_000u128;
        let rpw = reward_per_weight(reward, gw).unwrap();
        let back = weight_to_reward(gw, rpw).unwrap();
        assert!(back <= reward);
        assert!(reward - back <= gw / REWARD_PER_WEIGHT_MULT + 1);
    }

    proptest! {
        #[test]
        fn multiplier_monotone_in_duration(d1 in 0u64..MAX_LOCK, d2 in 0u64..MAX_LOCK) {
            let (a, b) = if d1 <= d2 { (d1, d2) } else { (d2, d1) };
            prop_assert!(lock_multiplier(0, a).unwrap() <= lock_multiplier(0, b).unwrap());
        }

        #[test]
        fn weight_linear_in_value(
            value in 0u128..1_000_000_000_000u128,
            duration in 0u64..=MAX_LOCK,
        ) {
            let w = lock_weight(value, 0, duration).unwrap();
            let m = lock_multiplier(0, duration).unwrap();
            prop_assert_eq!(w, m * value);
        }

        #[test]
        fn distributed_reward_never_exceeds_input(
            reward in 0u128..1_000_000_000_000u128,
            gw in 1u128..1_000_000_000_000_000u128,
        ) {
            let rpw = reward_per_weight(reward, gw).unwrap();
            let back = weight_to_reward(gw, rpw).unwrap();
            prop_assert!(back <= reward);
        }
    }
}
