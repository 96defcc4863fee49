//! Observable effects recorded by the engine (data, not side effects).
//!
//! The factory appends one entry per state transition of interest; hosts may
//! drain the log with [`crate::PoolFactory::take_events`] and forward entries
//! to their own event transport.

use serde::{Deserialize, Serialize};

use crate::{Address, Timestamp, TokenId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StakedFlexible {
        pool: TokenId,
        user: Address,
        value: u128,
    },
    StakedLocked {
        pool: TokenId,
        user: Address,
        stake_id: usize,
        value: u128,
        locked_until: Timestamp,
    },
    UnstakedFlexible {
        pool: TokenId,
        user: Address,
        value: u128,
    },
    UnstakedLocked {
        pool: TokenId,
        user: Address,
        stake_id: usize,
        value: u128,
        is_yield: bool,
    },
    LockExtended {
        pool: TokenId,
        user: Address,
        stake_id: usize,
        locked_from: Timestamp,
        locked_until: Timestamp,
    },
    Synced {
        pool: TokenId,
        yield_rewards_per_weight: u128,
        last_yield_distribution: Timestamp,
    },
    RewardsProcessed {
        pool: TokenId,
        user: Address,
        yield_value: u128,
        vault_value: u128,
    },
    RewardsClaimed {
        pool: TokenId,
        user: Address,
        value: u128,
        escrow: bool,
    },
    UserMigrated {
        pool: TokenId,
        from: Address,
        to: Address,
    },
    PoolRegistered {
        pool_token: TokenId,
        pool_address: Address,
        weight: u32,
    },
    PoolWeightChanged {
        pool: TokenId,
        from: u32,
        to: u32,
    },
    RewardPerSecondUpdated {
        previous: u128,
        current: u128,
    },
    EndTimeUpdated {
        previous: Timestamp,
        current: Timestamp,
    },
    VaultSet {
        previous: Address,
        current: Address,
    },
    VaultRewardsReceived {
        pool: TokenId,
        value: u128,
    },
    LockedStakesMigratedFromV1 {
        pool: TokenId,
        user: Address,
        stake_ids: Vec<u128>,
    },
    V1YieldMinted {
        pool: TokenId,
        user: Address,
        stake_ids: Vec<u128>,
        value: u128,
    },
}
