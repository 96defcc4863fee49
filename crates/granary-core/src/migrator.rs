//! Legacy (v1) stake ingestion.
//!
//! A pool may reference a read-only predecessor. Locked v1 stakes can be
//! referenced for a bonus reward weight without moving any tokens; once a v1
//! stake matures it can be materialised into a real stake, and v1 yield
//! stakes can be minted out directly. The bonus weight lives outside
//! `User::total_weight` and the pool's `global_weight`: it exists only inside
//! reward computations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::factory::PoolFactory;
use crate::math::{add_u128, lock_weight};
use crate::pool::Pool;
use crate::types::{EmissionView, Stake};
use crate::{Address, Clock, GranaryError, Result, Timestamp, TokenId, Tokens};

/// One deposit as reported by the legacy pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct V1Deposit {
    pub value: u128,
    pub weight: u128,
    pub locked_from: Timestamp,
    pub locked_until: Timestamp,
    pub is_yield: bool,
}

/// Read-only view of the legacy pool.
pub trait V1PoolView {
    fn get_deposit(&self, user: Address, stake_id: u128) -> Option<V1Deposit>;

    fn pool_token_reserve(&self) -> u128;

    fn users_locking_weight(&self) -> u128;
}

/// Immutable snapshot adapter over a legacy pool's deposits; what hosts
/// typically build once from archived v1 state.
#[derive(Clone, Debug, Default)]
pub struct StaticV1Pool {
    deposits: BTreeMap<(Address, u128), V1Deposit>,
    pool_token_reserve: u128,
    users_locking_weight: u128,
}

impl StaticV1Pool {
    pub fn new() -> StaticV1Pool {
        StaticV1Pool::default()
    }

    pub fn set_deposit(&mut self, user: Address, stake_id: u128, deposit: V1Deposit) {
        self.deposits.insert((user, stake_id), deposit);
    }

    pub fn set_totals(&mut self, pool_token_reserve: u128, users_locking_weight: u128) {
        self.pool_token_reserve = pool_token_reserve;
        self.users_locking_weight = users_locking_weight;
    }
}

impl V1PoolView for StaticV1Pool {
    fn get_deposit(&self, user: Address, stake_id: u128) -> Option<V1Deposit> {
        self.deposits.get(&(user, stake_id)).copied()
    }

    fn pool_token_reserve(&self) -> u128 {
        self.pool_token_reserve
    }

    fn users_locking_weight(&self) -> u128 {
        self.users_locking_weight
    }
}

impl Pool {
    /// Record one v1 stake reference. A non-zero entry in the per-user weight
    /// map is the "already ingested" guard, so re-ingestion fails instead of
    /// overwriting.
    pub(crate) fn ingest_v1_stake(
        &mut self,
        user_addr: Address,
        stake_id: u128,
        weight: u128,
    ) -> Result<()> {
        if stake_id == 0 {
            return Err(GranaryError::V1StakeRejected("zero stake id"));
        }
        if weight == 0 {
            return Err(GranaryError::V1StakeRejected("zero weight"));
        }
        let user = self.users.entry(user_addr).or_default();
        if user.v1_stakes_weights.get(&stake_id).copied().unwrap_or(0) != 0 {
            return Err(GranaryError::AlreadyMigrated);
        }
        user.v1_stakes_weights.insert(stake_id, weight);
        user.v1_stake_ids.push(stake_id);
        Ok(())
    }
}

fn migrate_locked_stake_inner<T: Tokens>(
    pool: &mut Pool,
    v1: &dyn V1PoolView,
    caller: Address,
    stake_ids: &[u128],
    now: Timestamp,
    view: &EmissionView,
    tokens: &mut T,
    events: &mut Vec<Event>,
) -> Result<()> {
    let vault_due = pool.begin_op(caller, now, view, events)?;
    for &stake_id in stake_ids {
        let deposit = v1
            .get_deposit(caller, stake_id)
            .ok_or(GranaryError::V1StakeRejected("unknown deposit"))?;
        if deposit.is_yield {
            return Err(GranaryError::V1StakeRejected("yield stakes are minted, not migrated"));
        }
        if deposit.locked_from == 0 {
            return Err(GranaryError::V1StakeRejected("deposit is not locked"));
        }
        if deposit.locked_from > pool.v1_stake_max_period {
            return Err(GranaryError::V1StakeRejected("locked after the migration cutoff"));
        }
        pool.ingest_v1_stake(caller, stake_id, deposit.weight)?;
    }
    events.push(Event::LockedStakesMigratedFromV1 {
        pool: pool.pool_token,
        user: caller,
        stake_ids: stake_ids.to_vec(),
    });
    tracing::info!(pool = %pool.pool_token, user = %caller, count = stake_ids.len(), "v1 stakes migrated");
    pool.finish_op(caller, vault_due, tokens)
}

fn fill_stake_id_inner<T: Tokens>(
    pool: &mut Pool,
    v1: &dyn V1PoolView,
    caller: Address,
    position: usize,
    now: Timestamp,
    view: &EmissionView,
    tokens: &mut T,
    events: &mut Vec<Event>,
) -> Result<usize> {
    let vault_due = pool.begin_op(caller, now, view, events)?;
    let stake_id = {
        let user = pool.users.entry(caller).or_default();
        user.v1_stake_ids
            .get(position)
            .copied()
            .ok_or(GranaryError::UnknownStake)?
    };
    if stake_id == 0 {
        return Err(GranaryError::UnknownStake);
    }
    let deposit = v1
        .get_deposit(caller, stake_id)
        .ok_or(GranaryError::V1StakeRejected("unknown deposit"))?;
    if now <= deposit.locked_until {
        return Err(GranaryError::StillLocked);
    }
    // Weight comes from the (already expired) v1 interval. The value is
    // owed, not held: the legacy tokens stay in the v1 pool, so the stake is
    // materialised by minting on unstake.
    let weight = lock_weight(deposit.value, deposit.locked_from, deposit.locked_until)?;

    let user = pool.users.entry(caller).or_default();
    let new_id = user.stakes.len();
    user.stakes.push(Stake {
        value: deposit.value,
        locked_from: deposit.locked_from,
        locked_until: deposit.locked_until,
        is_yield: true,
    });
    user.total_weight = add_u128(user.total_weight, weight, "user_weight")?;
    user.v1_stake_ids[position] = 0;
    pool.global_weight = add_u128(pool.global_weight, weight, "global_weight")?;
    pool.pool_token_reserve = add_u128(pool.pool_token_reserve, deposit.value, "pool_reserve")?;
    events.push(Event::StakedLocked {
        pool: pool.pool_token,
        user: caller,
        stake_id: new_id,
        value: deposit.value,
        locked_until: deposit.locked_until,
    });
    pool.finish_op(caller, vault_due, tokens)?;
    Ok(new_id)
}

impl<C: Clock, T: Tokens> PoolFactory<C, T> {
    /// Reference matured-or-not locked v1 stakes for a bonus reward weight.
    /// No value moves; only reward computations see the bonus.
    pub fn migrate_locked_stake(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        stake_ids: &[u128],
    ) -> Result<()> {
        if stake_ids.is_empty() {
            return Err(GranaryError::EmptyBatch);
        }
        if !self.v1_pools.contains_key(&pool_token) {
            return Err(GranaryError::V1PoolUnavailable);
        }
        let now = self.clock.now();
        let emission_before = self.emission;
        let events_mark = self.events.len();
        let checkpoint = self
            .pools
            .get(&pool_token)
            .ok_or(GranaryError::UnknownPool)?
            .checkpoint(&[caller]);
        let view = self.advance_emission(now);

        let res = {
            let Self {
                pools,
                v1_pools,
                tokens,
                events,
                ..
            } = self;
            let pool = pools.get_mut(&pool_token).ok_or(GranaryError::UnknownPool)?;
            let v1 = v1_pools
                .get(&pool_token)
                .ok_or(GranaryError::V1PoolUnavailable)?
                .as_ref();
            match pool.guard_enter() {
                Ok(()) => {
                    let r = migrate_locked_stake_inner(
                        pool, v1, caller, stake_ids, now, &view, tokens, events,
                    );
                    pool.guard_exit();
                    r
                }
                Err(e) => Err(e),
            }
        };
        if res.is_err() {
            self.emission = emission_before;
            self.events.truncate(events_mark);
            if let Some(pool) = self.pools.get_mut(&pool_token) {
                pool.restore(checkpoint);
            }
        }
        res
    }

    /// Materialise a matured v1 stake (by its position in the caller's
    /// ingested-id list) into a real stake. Returns the new stake id.
    pub fn fill_stake_id(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        position: usize,
    ) -> Result<usize> {
        if !self.v1_pools.contains_key(&pool_token) {
            return Err(GranaryError::V1PoolUnavailable);
        }
        let now = self.clock.now();
        let emission_before = self.emission;
        let events_mark = self.events.len();
        let checkpoint = self
            .pools
            .get(&pool_token)
            .ok_or(GranaryError::UnknownPool)?
            .checkpoint(&[caller]);
        let view = self.advance_emission(now);

        let res = {
            let Self {
                pools,
                v1_pools,
                tokens,
                events,
                ..
            } = self;
            let pool = pools.get_mut(&pool_token).ok_or(GranaryError::UnknownPool)?;
            let v1 = v1_pools
                .get(&pool_token)
                .ok_or(GranaryError::V1PoolUnavailable)?
                .as_ref();
            match pool.guard_enter() {
                Ok(()) => {
                    let r = fill_stake_id_inner(pool, v1, caller, position, now, &view, tokens, events);
                    pool.guard_exit();
                    r
                }
                Err(e) => Err(e),
            }
        };
        if res.is_err() {
            self.emission = emission_before;
            self.events.truncate(events_mark);
            if let Some(pool) = self.pools.get_mut(&pool_token) {
                pool.restore(checkpoint);
            }
        }
        res
    }

    /// Mint the reward token for one matured v1 yield stake.
    pub fn mint_v1_yield(&mut self, caller: Address, pool_token: TokenId, stake_id: u128) -> Result<u128> {
        self.mint_v1_yield_multiple(caller, pool_token, &[stake_id])
    }

    /// Mint the reward token for several matured v1 yield stakes at once;
    /// each id is validated first and a single mint moves the total.
    pub fn mint_v1_yield_multiple(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        stake_ids: &[u128],
    ) -> Result<u128> {
        if stake_ids.is_empty() {
            return Err(GranaryError::EmptyBatch);
        }
        let now = self.clock.now();
        let v1 = self
            .v1_pools
            .get(&pool_token)
            .ok_or(GranaryError::V1PoolUnavailable)?;
        let pool = self.pools.get(&pool_token).ok_or(GranaryError::UnknownPool)?;
        let consumed = pool.users.get(&caller).map(|u| &u.v1_stakes_weights);

        let mut seen: BTreeSet<u128> = BTreeSet::new();
        let mut marks: Vec<(u128, u128)> = Vec::with_capacity(stake_ids.len());
        let mut total: u128 = 0;
        for &stake_id in stake_ids {
            if stake_id == 0 {
                return Err(GranaryError::V1StakeRejected("zero stake id"));
            }
            if !seen.insert(stake_id) {
                return Err(GranaryError::AlreadyMigrated);
            }
            if consumed
                .and_then(|m| m.get(&stake_id))
                .copied()
                .unwrap_or(0)
                != 0
            {
                return Err(GranaryError::AlreadyMigrated);
            }
            let deposit = v1
                .get_deposit(caller, stake_id)
                .ok_or(GranaryError::V1StakeRejected("unknown deposit"))?;
            if !deposit.is_yield {
                return Err(GranaryError::V1StakeRejected("not a yield stake"));
            }
            if deposit.weight == 0 {
                return Err(GranaryError::V1StakeRejected("zero weight"));
            }
            if now <= deposit.locked_until {
                return Err(GranaryError::StillLocked);
            }
            total = add_u128(total, deposit.value, "v1_yield_total")?;
            marks.push((stake_id, deposit.weight));
        }

        let reward_token = self.config.reward_token;
        self.tokens.mint(reward_token, caller, total)?;
        let pool = self.pools.get_mut(&pool_token).ok_or(GranaryError::UnknownPool)?;
        let user = pool.users.entry(caller).or_default();
        for (stake_id, weight) in marks {
            user.v1_stakes_weights.insert(stake_id, weight);
        }
        self.events.push(Event::V1YieldMinted {
            pool: pool_token,
            user: caller,
            stake_ids: stake_ids.to_vec(),
            value: total,
        });
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ledger::InMemoryLedger;
    use crate::math::{MAX_LOCK, WEIGHT_MULT};
    use crate::types::PoolConfig;
    use crate::ManualClock;

    const INIT: Timestamp = 1_000_000;

    fn addr(b: u8) -> Address {
        Address([b; 32])
    }

    fn token(b: u8) -> TokenId {
        TokenId([b; 32])
    }

    fn reward_token() -> TokenId {
        token(10)
    }

    fn engine_with_v1() -> (PoolFactory<ManualClock, InMemoryLedger>, StaticV1Pool) {
        let config = EngineConfig::builder()
            .owner(addr(1))
            .factory_address(addr(2))
            .reward_token(reward_token())
            .escrow_token(token(11))
            .reward_per_second(1_000)
            .seconds_per_update(1_000_000)
            .end_time(INIT + 10_000_000)
            .build()
            .unwrap();
        let mut f =
            PoolFactory::new(config, ManualClock::new(INIT), InMemoryLedger::new()).unwrap();
        f.register_pool(
            addr(1),
            PoolConfig {
                pool_token: reward_token(),
                pool_address: addr(100),
                weight: 200,
                is_flash: false,
                v1_stake_max_period: INIT,
            },
        )
        .unwrap();

        let mut v1 = StaticV1Pool::new();
        // A regular locked v1 stake, still locked at INIT.
        v1.set_deposit(
            addr(3),
            7,
            V1Deposit {
                value: 4,
                weight: 4_000_000,
                locked_from: INIT - 100,
                locked_until: INIT + 500,
                is_yield: false,
            },
        );
        // A matured v1 yield stake.
        v1.set_deposit(
            addr(3),
            9,
            V1Deposit {
                value: 777,
                weight: 1_554_000_000,
                locked_from: INIT - MAX_LOCK,
                locked_until: INIT - 1,
                is_yield: true,
            },
        );
        v1.set_totals(100_000, 5_000_000_000);
        (f, v1)
    }

    fn attach(f: &mut PoolFactory<ManualClock, InMemoryLedger>, v1: &StaticV1Pool) {
        f.set_v1_pool(addr(1), reward_token(), Box::new(v1.clone()))
            .unwrap();
    }

    #[test]
    fn migration_requires_a_v1_pool() {
        let (mut f, _) = engine_with_v1();
        assert_eq!(
            f.migrate_locked_stake(addr(3), reward_token(), &[7]),
            Err(GranaryError::V1PoolUnavailable)
        );
    }

    #[test]
    fn migrated_stake_adds_bonus_to_rewards_only() {
        let (mut f, v1) = engine_with_v1();
        attach(&mut f, &v1);
        let alice = addr(3);
        f.tokens_mut().mint(reward_token(), alice, 1_000).unwrap();
        f.stake_flexible(alice, reward_token(), 10).unwrap();

        f.migrate_locked_stake(alice, reward_token(), &[7]).unwrap();
        let user = f.user(reward_token(), alice).unwrap();
        assert_eq!(user.total_weight, 10 * WEIGHT_MULT);
        assert_eq!(user.v1_stake_ids, vec![7]);
        assert_eq!(user.v1_bonus_weight().unwrap(), 12_000_000);
        assert_eq!(
            f.pool(reward_token()).unwrap().global_weight(),
            10 * WEIGHT_MULT
        );

        // Rewards accrue at the bonus-adjusted weight: (1e7 + 1.2e7) weight
        // over a 1e7 global weight.
        f.clock_mut().advance(100);
        let pending = f.pending_rewards(reward_token(), alice).unwrap();
        assert_eq!(pending.yield_rewards, 220_000);
    }

    #[test]
    fn double_migration_is_rejected() {
        let (mut f, v1) = engine_with_v1();
        attach(&mut f, &v1);
        let alice = addr(3);
        f.migrate_locked_stake(alice, reward_token(), &[7]).unwrap();
        assert_eq!(
            f.migrate_locked_stake(alice, reward_token(), &[7]),
            Err(GranaryError::AlreadyMigrated)
        );
        // The failed batch did not append a duplicate id.
        assert_eq!(f.user(reward_token(), alice).unwrap().v1_stake_ids, vec![7]);
    }

    #[test]
    fn migration_rejects_unqualified_deposits() {
        let (mut f, mut v1) = engine_with_v1();
        let alice = addr(3);
        // Unlocked and post-cutoff deposits.
        v1.set_deposit(
            alice,
            20,
            V1Deposit {
                value: 1,
                weight: 1_000_000,
                locked_from: 0,
                locked_until: INIT + 10,
                is_yield: false,
            },
        );
        v1.set_deposit(
            alice,
            21,
            V1Deposit {
                value: 1,
                weight: 1_000_000,
                locked_from: INIT + 5,
                locked_until: INIT + 10,
                is_yield: false,
            },
        );
        attach(&mut f, &v1);

        assert!(matches!(
            f.migrate_locked_stake(alice, reward_token(), &[9]),
            Err(GranaryError::V1StakeRejected(_))
        ));
        assert!(matches!(
            f.migrate_locked_stake(alice, reward_token(), &[20]),
            Err(GranaryError::V1StakeRejected(_))
        ));
        assert!(matches!(
            f.migrate_locked_stake(alice, reward_token(), &[21]),
            Err(GranaryError::V1StakeRejected(_))
        ));
        assert!(matches!(
            f.migrate_locked_stake(alice, reward_token(), &[99]),
            Err(GranaryError::V1StakeRejected(_))
        ));
        // A failed batch leaves no partial ingestion behind.
        assert!(matches!(
            f.migrate_locked_stake(alice, reward_token(), &[7, 9]),
            Err(GranaryError::V1StakeRejected(_))
        ));
        assert!(f
            .user(reward_token(), alice)
            .map(|u| u.v1_stake_ids.is_empty())
            .unwrap_or(true));
    }

    #[test]
    fn fill_stake_id_materialises_matured_stake() {
        let (mut f, v1) = engine_with_v1();
        attach(&mut f, &v1);
        let alice = addr(3);
        f.migrate_locked_stake(alice, reward_token(), &[7]).unwrap();

        // Still locked on the v1 side.
        assert_eq!(
            f.fill_stake_id(alice, reward_token(), 0),
            Err(GranaryError::StillLocked)
        );

        f.clock_mut().set(INIT + 501);
        let stake_id = f.fill_stake_id(alice, reward_token(), 0).unwrap();
        let stake = f.get_stake(reward_token(), alice, stake_id).unwrap();
        assert!(stake.is_yield);
        assert_eq!(stake.value, 4);
        assert_eq!(stake.locked_from, INIT - 100);
        assert_eq!(stake.locked_until, INIT + 500);

        let user = f.user(reward_token(), alice).unwrap();
        let expected_weight = stake.weight().unwrap();
        assert_eq!(user.total_weight, expected_weight);
        // The slot is zeroed, so the bonus is gone but the guard remains.
        assert_eq!(user.v1_stake_ids, vec![0]);
        assert_eq!(user.v1_bonus_weight().unwrap(), 0);
        assert_eq!(
            f.pool(reward_token()).unwrap().global_weight(),
            expected_weight
        );
        assert_eq!(f.pool(reward_token()).unwrap().pool_token_reserve(), 4);

        // Cannot fill the same slot twice, and the id cannot be re-migrated.
        assert_eq!(
            f.fill_stake_id(alice, reward_token(), 0),
            Err(GranaryError::UnknownStake)
        );
        assert_eq!(
            f.migrate_locked_stake(alice, reward_token(), &[7]),
            Err(GranaryError::AlreadyMigrated)
        );

        // The materialised stake is already expired and mints on unstake.
        f.unstake_locked(alice, reward_token(), stake_id, 4).unwrap();
        assert_eq!(f.tokens().balance_of(reward_token(), alice), 4);
    }

    #[test]
    fn mint_v1_yield_pays_once() {
        let (mut f, v1) = engine_with_v1();
        attach(&mut f, &v1);
        let alice = addr(3);

        let minted = f.mint_v1_yield(alice, reward_token(), 9).unwrap();
        assert_eq!(minted, 777);
        assert_eq!(f.tokens().balance_of(reward_token(), alice), 777);
        assert_eq!(
            f.mint_v1_yield(alice, reward_token(), 9),
            Err(GranaryError::AlreadyMigrated)
        );
        // The consumed id never contributes bonus weight.
        assert_eq!(
            f.user(reward_token(), alice).unwrap().v1_bonus_weight().unwrap(),
            0
        );
    }

    #[test]
    fn mint_v1_yield_rejects_regular_stakes_and_duplicates() {
        let (mut f, v1) = engine_with_v1();
        attach(&mut f, &v1);
        let alice = addr(3);

        assert!(matches!(
            f.mint_v1_yield(alice, reward_token(), 7),
            Err(GranaryError::V1StakeRejected(_))
        ));
        assert_eq!(
            f.mint_v1_yield_multiple(alice, reward_token(), &[9, 9]),
            Err(GranaryError::AlreadyMigrated)
        );
        // Duplicate rejection happened before any mint.
        assert_eq!(f.tokens().balance_of(reward_token(), alice), 0);
    }

    #[test]
    fn migrate_user_leaves_v1_bonus_behind() {
        let (mut f, v1) = engine_with_v1();
        attach(&mut f, &v1);
        let alice = addr(3);
        let fresh = addr(4);
        f.tokens_mut().mint(reward_token(), alice, 1_000).unwrap();
        f.stake_flexible(alice, reward_token(), 10).unwrap();
        f.migrate_locked_stake(alice, reward_token(), &[7]).unwrap();

        f.migrate_user(alice, reward_token(), fresh).unwrap();

        // The v1 bookkeeping stays on the source record; the migrated-to
        // record accrues without the bonus from here on.
        let source = f.user(reward_token(), alice).unwrap();
        assert_eq!(source.v1_stake_ids, vec![7]);
        assert_eq!(source.total_weight, 0);
        let dest = f.user(reward_token(), fresh).unwrap();
        assert!(dest.v1_stake_ids.is_empty());
        assert_eq!(dest.total_weight, 10 * WEIGHT_MULT);

        f.clock_mut().advance(100);
        // Destination earns at its stored weight only (the whole global
        // weight here), while the source keeps earning on the orphaned bonus.
        let dest_pending = f.pending_rewards(reward_token(), fresh).unwrap();
        assert_eq!(dest_pending.yield_rewards, 100_000);
        let source_pending = f.pending_rewards(reward_token(), alice).unwrap();
        assert_eq!(source_pending.yield_rewards, 120_000);
    }
}
