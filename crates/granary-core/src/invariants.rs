//! Machine-checkable engine invariants.
//!
//! These run in tests (and may be wired into host assertions) against a pool
//! at quiescence, i.e. between operations. Stable identifiers keep failures
//! comparable across runs.

use crate::math::weight_to_reward;
use crate::pool::Pool;
use crate::types::User;
use crate::{Address, GranaryError, Result};

/// Stable identifiers for pool invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantId {
    /// `global_weight` disagreed with the sum of stored user weights.
    GlobalWeightMatchesUsers,

    /// A user's stored weight disagreed with the sum of their stake weights
    /// plus the flexible balance.
    UserWeightMatchesStakes,

    /// A user's yield checkpoint exceeded the current accumulator value
    /// (their pending accrual would be negative).
    YieldCheckpointBounded,

    /// A user's vault checkpoint exceeded the current accumulator value.
    VaultCheckpointBounded,

    /// The operating user's checkpoint was not refreshed to the current
    /// accumulator after an operation.
    CheckpointFresh,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolation {
    pub id: InvariantId,
    pub details: String,
}

impl InvariantViolation {
    pub fn new(id: InvariantId, details: impl Into<String>) -> InvariantViolation {
        InvariantViolation {
            id,
            details: details.into(),
        }
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.id, self.details)
    }
}

impl std::error::Error for InvariantViolation {}

impl From<InvariantViolation> for GranaryError {
    fn from(v: InvariantViolation) -> GranaryError {
        GranaryError::InvariantViolated(v.to_string())
    }
}

type Check = std::result::Result<(), InvariantViolation>;

/// Check the whole-pool invariants. Returns the first violation found.
///
/// Checkpoints of users who have not operated since the last accumulator
/// movement legitimately lag behind, so only boundedness is enforced here;
/// use [`check_user_checkpoint`] for the exact post-operation equality.
pub fn check_pool(pool: &Pool) -> Check {
    let mut users_total: u128 = 0;
    for (addr, user) in &pool.users {
        users_total = users_total.checked_add(user.total_weight).ok_or_else(|| {
            InvariantViolation::new(
                InvariantId::GlobalWeightMatchesUsers,
                "user weight sum overflowed",
            )
        })?;

        let stake_sum = stake_weight_sum(user).map_err(|e| {
            InvariantViolation::new(InvariantId::UserWeightMatchesStakes, e.to_string())
        })?;
        if stake_sum != user.total_weight {
            return Err(InvariantViolation::new(
                InvariantId::UserWeightMatchesStakes,
                format!(
                    "user {addr}: stakes sum {stake_sum} != stored {}",
                    user.total_weight
                ),
            ));
        }

        let effective = user.effective_weight().map_err(|e| {
            InvariantViolation::new(InvariantId::YieldCheckpointBounded, e.to_string())
        })?;
        let yield_now = weight_to_reward(effective, pool.yield_rewards_per_weight)
            .map_err(|e| InvariantViolation::new(InvariantId::YieldCheckpointBounded, e.to_string()))?;
        if user.sub_yield_rewards > yield_now {
            return Err(InvariantViolation::new(
                InvariantId::YieldCheckpointBounded,
                format!(
                    "user {addr}: sub_yield_rewards {} > accumulated {yield_now}",
                    user.sub_yield_rewards
                ),
            ));
        }
        let vault_now = weight_to_reward(effective, pool.vault_rewards_per_weight)
            .map_err(|e| InvariantViolation::new(InvariantId::VaultCheckpointBounded, e.to_string()))?;
        if user.sub_vault_rewards > vault_now {
            return Err(InvariantViolation::new(
                InvariantId::VaultCheckpointBounded,
                format!(
                    "user {addr}: sub_vault_rewards {} > accumulated {vault_now}",
                    user.sub_vault_rewards
                ),
            ));
        }
    }
    if users_total != pool.global_weight {
        return Err(InvariantViolation::new(
            InvariantId::GlobalWeightMatchesUsers,
            format!(
                "sum of user weights {users_total} != global weight {}",
                pool.global_weight
            ),
        ));
    }
    Ok(())
}

/// Exact checkpoint equality for a user that just operated: both sub-reward
/// checkpoints must equal `effective_weight * rpw / SCALE` under the current
/// accumulators.
pub fn check_user_checkpoint(pool: &Pool, user_addr: Address) -> Check {
    let user = match pool.user(user_addr) {
        Some(u) => u,
        None => return Ok(()),
    };
    let effective = user
        .effective_weight()
        .map_err(|e| InvariantViolation::new(InvariantId::CheckpointFresh, e.to_string()))?;
    let expected_yield = weight_to_reward(effective, pool.yield_rewards_per_weight())
        .map_err(|e| InvariantViolation::new(InvariantId::CheckpointFresh, e.to_string()))?;
    let expected_vault = weight_to_reward(effective, pool.vault_rewards_per_weight())
        .map_err(|e| InvariantViolation::new(InvariantId::CheckpointFresh, e.to_string()))?;
    if user.sub_yield_rewards != expected_yield || user.sub_vault_rewards != expected_vault {
        return Err(InvariantViolation::new(
            InvariantId::CheckpointFresh,
            format!(
                "user {user_addr}: checkpoints ({}, {}) != expected ({expected_yield}, {expected_vault})",
                user.sub_yield_rewards, user.sub_vault_rewards
            ),
        ));
    }
    Ok(())
}

fn stake_weight_sum(user: &User) -> Result<u128> {
    let mut total = crate::math::mul_u128(
        user.flexible_balance,
        crate::math::WEIGHT_MULT,
        "invariant_flexible_weight",
    )?;
    for stake in &user.stakes {
        total = crate::math::add_u128(total, stake.weight()?, "invariant_stake_weight")?;
    }
    Ok(total)
}
