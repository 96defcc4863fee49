//! Engine data model: stakes, user records, pool metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::math::{add_u128, v1_to_v2_weight};
use crate::{Address, Result, Timestamp, TokenId};

/// A single stake entry.
///
/// Entries are append-only and positionally identified; a fully unstaked
/// entry becomes a zero-valued tombstone so later positions never shift.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub value: u128,
    pub locked_from: Timestamp,
    pub locked_until: Timestamp,
    /// Marks a stake created by the engine out of a claimed reward (or a
    /// materialised legacy stake); its value is minted on unstake rather than
    /// transferred.
    pub is_yield: bool,
}

impl Stake {
    pub fn is_live(&self) -> bool {
        self.value > 0
    }

    pub fn is_locked(&self, now: Timestamp) -> bool {
        now <= self.locked_until
    }

    pub fn weight(&self) -> Result<u128> {
        crate::math::lock_weight(self.value, self.locked_from, self.locked_until)
    }
}

/// Per-user pool record, created lazily on first interaction and kept
/// permanently.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Append-only stake list; removed stakes become tombstones.
    pub stakes: Vec<Stake>,
    /// Unlocked balance staked via the flexible path (no stake entry).
    pub flexible_balance: u128,
    /// Sum of stake weights plus `flexible_balance * WEIGHT_MULT`. Does NOT
    /// include the v1 bonus, which is tracked separately.
    pub total_weight: u128,
    /// Checkpoint: `effective_weight * yield_rewards_per_weight / SCALE` at the
    /// last operation.
    pub sub_yield_rewards: u128,
    /// Checkpoint for the vault accumulator, maintained in lockstep with
    /// `sub_yield_rewards`.
    pub sub_vault_rewards: u128,
    /// Yield crystallised by `process_rewards` and not yet claimed.
    pub pending_yield: u128,
    /// Ingested v1 stake ids; a slot is zeroed once the stake is materialised.
    pub v1_stake_ids: Vec<u128>,
    /// v1 id -> recorded v1 weight. A non-zero entry doubles as the
    /// "already ingested / already consumed" guard.
    pub v1_stakes_weights: BTreeMap<u128, u128>,
}

impl User {
    /// Bonus weight contributed by live (unmaterialised) v1 stakes, already
    /// translated through the v1 -> v2 factor. Counted in reward computations
    /// only, never in `total_weight` or the pool's `global_weight`.
    pub fn v1_bonus_weight(&self) -> Result<u128> {
        let mut total: u128 = 0;
        for id in &self.v1_stake_ids {
            if *id == 0 {
                continue;
            }
            let w = self.v1_stakes_weights.get(id).copied().unwrap_or(0);
            total = add_u128(total, w, "v1_bonus_weight")?;
        }
        v1_to_v2_weight(total)
    }

    /// Weight used for reward computations: stored weight plus v1 bonus.
    pub fn effective_weight(&self) -> Result<u128> {
        add_u128(self.total_weight, self.v1_bonus_weight()?, "effective_weight")
    }

    /// Sum of live stake values plus the flexible balance.
    pub fn balance(&self) -> Result<u128> {
        let mut total = self.flexible_balance;
        for stake in &self.stakes {
            total = add_u128(total, stake.value, "user_balance")?;
        }
        Ok(total)
    }
}

/// Registration parameters for a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_token: TokenId,
    pub pool_address: Address,
    /// Share of the global emission: `weight / factory.total_weight`.
    pub weight: u32,
    pub is_flash: bool,
    /// Latest `locked_from` accepted from the legacy pool during migration.
    /// Zero when the pool has no legacy predecessor.
    pub v1_stake_max_period: Timestamp,
}

/// Registry view of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolData {
    pub pool_token: TokenId,
    pub pool_address: Address,
    pub weight: u32,
    pub is_flash: bool,
}

/// One entry of a batched locked unstake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnstakeItem {
    pub stake_id: usize,
    pub value: u128,
}

/// Result of the `pending_rewards` view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRewards {
    /// Emission yield claimable right now (accumulator advanced to `now`).
    pub yield_rewards: u128,
    /// Vault-funded rewards that the next operation will pay out.
    pub vault_rewards: u128,
}

/// Snapshot of the factory emission state a pool needs during sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmissionView {
    pub reward_per_second: u128,
    pub total_pool_weight: u32,
    pub end_time: Timestamp,
}
