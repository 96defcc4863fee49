//! Per-pool state and the stake/unstake/lock/claim core.
//!
//! Every mutating operation follows the same shape: sync the accumulator to
//! `now`, crystallise the caller's pending rewards, validate, mutate weights,
//! refresh the caller's sub-reward checkpoints from the post-mutation weight,
//! and only then touch the token layer. Failing to refresh the checkpoint
//! after a weight mutation is the canonical bug class this layout prevents.

use std::collections::BTreeMap;

use crate::events::Event;
use crate::math::{
    add_u128, lock_multiplier, mul_div_floor_u128, mul_u128, reward_per_weight, sub_u128,
    weight_to_reward, MAX_LOCK, WEIGHT_MULT, YEAR_WEIGHT_MULT,
};
use crate::types::{EmissionView, PendingRewards, PoolConfig, Stake, UnstakeItem, User};
use crate::{Address, GranaryError, Result, Timestamp, TokenId, Tokens};

/// Where a claim routed the crystallised yield.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClaimRoute {
    /// Nothing pending.
    Nothing,
    /// Escrow token minted directly to the user.
    Escrowed(u128),
    /// Compounded into a max-lock yield stake in this pool.
    Compounded(u128),
    /// Must be forwarded to the reward-token pool by the factory.
    Routed(u128),
}

impl ClaimRoute {
    pub(crate) fn amount(&self) -> u128 {
        match self {
            ClaimRoute::Nothing => 0,
            ClaimRoute::Escrowed(v) | ClaimRoute::Compounded(v) | ClaimRoute::Routed(v) => *v,
        }
    }
}

/// Rollback unit for one operation: pool scalars plus the touched user
/// records. Restoring a checkpoint undoes every engine-side effect of a
/// failed operation.
#[derive(Clone, Debug)]
pub(crate) struct PoolCheckpoint {
    weight: u32,
    last_yield_distribution: Timestamp,
    yield_rewards_per_weight: u128,
    vault_rewards_per_weight: u128,
    global_weight: u128,
    pool_token_reserve: u128,
    entered: bool,
    users: Vec<(Address, Option<User>)>,
}

/// A single staking pool.
#[derive(Clone, Debug)]
pub struct Pool {
    pub(crate) address: Address,
    pub(crate) pool_token: TokenId,
    pub(crate) reward_token: TokenId,
    pub(crate) escrow_token: TokenId,
    pub(crate) weight: u32,
    pub(crate) is_flash: bool,
    pub(crate) last_yield_distribution: Timestamp,
    pub(crate) yield_rewards_per_weight: u128,
    pub(crate) vault_rewards_per_weight: u128,
    pub(crate) global_weight: u128,
    pub(crate) pool_token_reserve: u128,
    pub(crate) v1_stake_max_period: Timestamp,
    pub(crate) users: BTreeMap<Address, User>,
    pub(crate) entered: bool,
}

impl Pool {
    pub(crate) fn new(
        spec: &PoolConfig,
        reward_token: TokenId,
        escrow_token: TokenId,
        now: Timestamp,
    ) -> Pool {
        Pool {
            address: spec.pool_address,
            pool_token: spec.pool_token,
            reward_token,
            escrow_token,
            weight: spec.weight,
            is_flash: spec.is_flash,
            last_yield_distribution: now,
            yield_rewards_per_weight: 0,
            vault_rewards_per_weight: 0,
            global_weight: 0,
            pool_token_reserve: 0,
            v1_stake_max_period: spec.v1_stake_max_period,
            users: BTreeMap::new(),
            entered: false,
        }
    }

    // ---- accessors -------------------------------------------------------

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn pool_token(&self) -> TokenId {
        self.pool_token
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_flash_pool(&self) -> bool {
        self.is_flash
    }

    pub fn last_yield_distribution(&self) -> Timestamp {
        self.last_yield_distribution
    }

    pub fn yield_rewards_per_weight(&self) -> u128 {
        self.yield_rewards_per_weight
    }

    pub fn vault_rewards_per_weight(&self) -> u128 {
        self.vault_rewards_per_weight
    }

    pub fn global_weight(&self) -> u128 {
        self.global_weight
    }

    pub fn pool_token_reserve(&self) -> u128 {
        self.pool_token_reserve
    }

    pub fn user(&self, user: Address) -> Option<&User> {
        self.users.get(&user)
    }

    pub fn get_stake(&self, user: Address, stake_id: usize) -> Option<Stake> {
        self.users.get(&user)?.stakes.get(stake_id).copied()
    }

    pub fn stakes_length(&self, user: Address) -> usize {
        self.users.get(&user).map(|u| u.stakes.len()).unwrap_or(0)
    }

    pub fn v1_stake_id(&self, user: Address, position: usize) -> Option<u128> {
        self.users.get(&user)?.v1_stake_ids.get(position).copied()
    }

    /// Linear scan for an ingested v1 id. `None` means the id was never
    /// ingested, distinct from a hit at position 0.
    pub fn v1_stake_position(&self, user: Address, stake_id: u128) -> Option<usize> {
        self.users
            .get(&user)?
            .v1_stake_ids
            .iter()
            .position(|id| *id == stake_id)
    }

    /// Sum of live stake values plus the flexible balance.
    pub fn balance_of(&self, user: Address) -> Result<u128> {
        match self.users.get(&user) {
            Some(u) => u.balance(),
            None => Ok(0),
        }
    }

    // ---- reentry guard ---------------------------------------------------

    pub(crate) fn guard_enter(&mut self) -> Result<()> {
        if self.entered {
            return Err(GranaryError::Reentrancy);
        }
        self.entered = true;
        Ok(())
    }

    pub(crate) fn guard_exit(&mut self) {
        self.entered = false;
    }

    // ---- checkpoint ------------------------------------------------------

    pub(crate) fn checkpoint(&self, touched: &[Address]) -> PoolCheckpoint {
        PoolCheckpoint {
            weight: self.weight,
            last_yield_distribution: self.last_yield_distribution,
            yield_rewards_per_weight: self.yield_rewards_per_weight,
            vault_rewards_per_weight: self.vault_rewards_per_weight,
            global_weight: self.global_weight,
            pool_token_reserve: self.pool_token_reserve,
            entered: self.entered,
            users: touched
                .iter()
                .map(|a| (*a, self.users.get(a).cloned()))
                .collect(),
        }
    }

    pub(crate) fn restore(&mut self, checkpoint: PoolCheckpoint) {
        self.weight = checkpoint.weight;
        self.last_yield_distribution = checkpoint.last_yield_distribution;
        self.yield_rewards_per_weight = checkpoint.yield_rewards_per_weight;
        self.vault_rewards_per_weight = checkpoint.vault_rewards_per_weight;
        self.global_weight = checkpoint.global_weight;
        self.pool_token_reserve = checkpoint.pool_token_reserve;
        self.entered = checkpoint.entered;
        for (addr, user) in checkpoint.users {
            match user {
                Some(u) => {
                    self.users.insert(addr, u);
                }
                None => {
                    self.users.remove(&addr);
                }
            }
        }
    }

    // ---- sync ------------------------------------------------------------

    /// Advance the yield accumulator to `now`, capped at the emission end.
    ///
    /// The factory applies the rate decay before building `view`, so the first
    /// second after a decay already integrates at the decayed rate.
    pub(crate) fn sync(
        &mut self,
        now: Timestamp,
        view: &EmissionView,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        if self.last_yield_distribution >= view.end_time {
            return Ok(());
        }
        if now <= self.last_yield_distribution {
            return Ok(());
        }
        if self.global_weight == 0 {
            self.last_yield_distribution = now;
            events.push(Event::Synced {
                pool: self.pool_token,
                yield_rewards_per_weight: self.yield_rewards_per_weight,
                last_yield_distribution: now,
            });
            return Ok(());
        }
        let cap = now.min(view.end_time);
        let elapsed = (cap - self.last_yield_distribution) as u128;
        let reward = self.interval_reward(elapsed, view)?;
        if reward > 0 {
            self.yield_rewards_per_weight = add_u128(
                self.yield_rewards_per_weight,
                reward_per_weight(reward, self.global_weight)?,
                "sync_accumulator",
            )?;
        }
        self.last_yield_distribution = cap;
        tracing::debug!(
            pool = %self.pool_token,
            reward,
            rpw = self.yield_rewards_per_weight,
            "pool synced"
        );
        events.push(Event::Synced {
            pool: self.pool_token,
            yield_rewards_per_weight: self.yield_rewards_per_weight,
            last_yield_distribution: cap,
        });
        Ok(())
    }

    /// Reward emitted to this pool over `elapsed` seconds:
    /// `elapsed * reward_per_second * weight / total_pool_weight`.
    fn interval_reward(&self, elapsed: u128, view: &EmissionView) -> Result<u128> {
        if view.total_pool_weight == 0 || self.weight == 0 {
            return Ok(0);
        }
        mul_div_floor_u128(
            mul_u128(elapsed, view.reward_per_second, "interval_reward")?,
            self.weight as u128,
            view.total_pool_weight as u128,
            "interval_reward",
        )
    }

    // ---- operation prologue / epilogue ----------------------------------

    /// sync + crystallise the user's pending rewards. Returns the vault
    /// reward due, which the epilogue pays out once state is consistent.
    pub(crate) fn begin_op(
        &mut self,
        user: Address,
        now: Timestamp,
        view: &EmissionView,
        events: &mut Vec<Event>,
    ) -> Result<u128> {
        self.sync(now, view, events)?;
        self.process_rewards(user, events)
    }

    /// Pending yield since the user's last checkpoint, accrued at the
    /// v1-bonus-adjusted weight, is moved into `pending_yield`; the vault
    /// delta is returned for payout.
    fn process_rewards(&mut self, user_addr: Address, events: &mut Vec<Event>) -> Result<u128> {
        let yield_rpw = self.yield_rewards_per_weight;
        let vault_rpw = self.vault_rewards_per_weight;
        let pool_token = self.pool_token;

        let user = self.users.entry(user_addr).or_default();
        let effective = user.effective_weight()?;
        let pending_yield = sub_u128(
            weight_to_reward(effective, yield_rpw)?,
            user.sub_yield_rewards,
            "process_yield",
        )?;
        let pending_vault = sub_u128(
            weight_to_reward(effective, vault_rpw)?,
            user.sub_vault_rewards,
            "process_vault",
        )?;
        if pending_yield == 0 && pending_vault == 0 {
            return Ok(0);
        }
        user.pending_yield = add_u128(user.pending_yield, pending_yield, "pending_yield")?;
        events.push(Event::RewardsProcessed {
            pool: pool_token,
            user: user_addr,
            yield_value: pending_yield,
            vault_value: pending_vault,
        });
        Ok(pending_vault)
    }

    /// Refresh both sub-reward checkpoints from the post-mutation effective
    /// weight, then pay out any vault reward crystallised by the prologue.
    pub(crate) fn finish_op<T: Tokens>(
        &mut self,
        user_addr: Address,
        vault_due: u128,
        tokens: &mut T,
    ) -> Result<()> {
        let yield_rpw = self.yield_rewards_per_weight;
        let vault_rpw = self.vault_rewards_per_weight;
        let user = self.users.entry(user_addr).or_default();
        let effective = user.effective_weight()?;
        user.sub_yield_rewards = weight_to_reward(effective, yield_rpw)?;
        user.sub_vault_rewards = weight_to_reward(effective, vault_rpw)?;
        if vault_due > 0 {
            tokens.transfer(self.reward_token, self.address, user_addr, vault_due)?;
        }
        Ok(())
    }

    /// Deflation-safe deposit: the pool credits what it measured, not what
    /// was requested.
    fn collect_deposit<T: Tokens>(
        &mut self,
        from: Address,
        value: u128,
        tokens: &mut T,
    ) -> Result<u128> {
        let before = tokens.balance_of(self.pool_token, self.address);
        tokens.transfer(self.pool_token, from, self.address, value)?;
        let after = tokens.balance_of(self.pool_token, self.address);
        sub_u128(after, before, "collect_deposit")
    }

    // ---- staking ---------------------------------------------------------

    pub(crate) fn stake_flexible<T: Tokens>(
        &mut self,
        user_addr: Address,
        value: u128,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<u128> {
        if value == 0 {
            return Err(GranaryError::ZeroValue);
        }
        let vault_due = self.begin_op(user_addr, now, view, events)?;
        let added = self.collect_deposit(user_addr, value, tokens)?;
        let weight = mul_u128(added, WEIGHT_MULT, "stake_weight")?;

        let pool_token = self.pool_token;
        let user = self.users.entry(user_addr).or_default();
        user.flexible_balance = add_u128(user.flexible_balance, added, "flexible_balance")?;
        user.total_weight = add_u128(user.total_weight, weight, "user_weight")?;
        self.global_weight = add_u128(self.global_weight, weight, "global_weight")?;
        self.pool_token_reserve = add_u128(self.pool_token_reserve, added, "pool_reserve")?;
        events.push(Event::StakedFlexible {
            pool: pool_token,
            user: user_addr,
            value: added,
        });
        self.finish_op(user_addr, vault_due, tokens)?;
        Ok(added)
    }

    pub(crate) fn stake_and_lock<T: Tokens>(
        &mut self,
        user_addr: Address,
        value: u128,
        locked_until: Timestamp,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<usize> {
        if value == 0 {
            return Err(GranaryError::ZeroValue);
        }
        if locked_until != 0 && (locked_until <= now || locked_until - now > MAX_LOCK) {
            return Err(GranaryError::InvalidLock);
        }
        let vault_due = self.begin_op(user_addr, now, view, events)?;
        let added = self.collect_deposit(user_addr, value, tokens)?;
        let locked_from = if locked_until > 0 { now } else { 0 };
        let stake = Stake {
            value: added,
            locked_from,
            locked_until,
            is_yield: false,
        };
        let weight = stake.weight()?;

        let pool_token = self.pool_token;
        let user = self.users.entry(user_addr).or_default();
        let stake_id = user.stakes.len();
        user.stakes.push(stake);
        user.total_weight = add_u128(user.total_weight, weight, "user_weight")?;
        self.global_weight = add_u128(self.global_weight, weight, "global_weight")?;
        self.pool_token_reserve = add_u128(self.pool_token_reserve, added, "pool_reserve")?;
        events.push(Event::StakedLocked {
            pool: pool_token,
            user: user_addr,
            stake_id,
            value: added,
            locked_until,
        });
        self.finish_op(user_addr, vault_due, tokens)?;
        Ok(stake_id)
    }

    // ---- unstaking -------------------------------------------------------

    pub(crate) fn unstake_flexible<T: Tokens>(
        &mut self,
        user_addr: Address,
        value: u128,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        if value == 0 {
            return Err(GranaryError::ZeroValue);
        }
        let vault_due = self.begin_op(user_addr, now, view, events)?;
        let weight = mul_u128(value, WEIGHT_MULT, "unstake_weight")?;

        let pool_token = self.pool_token;
        let user = self.users.entry(user_addr).or_default();
        if user.flexible_balance < value {
            return Err(GranaryError::InsufficientBalance);
        }
        user.flexible_balance -= value;
        user.total_weight = sub_u128(user.total_weight, weight, "user_weight")?;
        self.global_weight = sub_u128(self.global_weight, weight, "global_weight")?;
        self.pool_token_reserve = sub_u128(self.pool_token_reserve, value, "pool_reserve")?;
        events.push(Event::UnstakedFlexible {
            pool: pool_token,
            user: user_addr,
            value,
        });
        self.finish_op(user_addr, vault_due, tokens)?;
        tokens.transfer(self.pool_token, self.address, user_addr, value)?;
        Ok(())
    }

    pub(crate) fn unstake_locked<T: Tokens>(
        &mut self,
        user_addr: Address,
        stake_id: usize,
        value: u128,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        if value == 0 {
            return Err(GranaryError::ZeroValue);
        }
        let vault_due = self.begin_op(user_addr, now, view, events)?;

        let pool_token = self.pool_token;
        let user = self.users.entry(user_addr).or_default();
        let stake = user
            .stakes
            .get(stake_id)
            .copied()
            .ok_or(GranaryError::UnknownStake)?;
        if stake.is_locked(now) {
            return Err(GranaryError::StillLocked);
        }
        if value > stake.value {
            return Err(GranaryError::ValueExceedsStake);
        }
        let weight_removed = mul_u128(
            lock_multiplier(stake.locked_from, stake.locked_until)?,
            value,
            "unstake_weight",
        )?;

        // Tombstone instead of removal: positions are permanent identifiers.
        user.stakes[stake_id].value = stake.value - value;
        user.total_weight = sub_u128(user.total_weight, weight_removed, "user_weight")?;
        self.global_weight = sub_u128(self.global_weight, weight_removed, "global_weight")?;
        self.pool_token_reserve = sub_u128(self.pool_token_reserve, value, "pool_reserve")?;
        events.push(Event::UnstakedLocked {
            pool: pool_token,
            user: user_addr,
            stake_id,
            value,
            is_yield: stake.is_yield,
        });
        self.finish_op(user_addr, vault_due, tokens)?;
        if stake.is_yield {
            tokens.mint(self.reward_token, user_addr, value)?;
        } else {
            tokens.transfer(self.pool_token, self.address, user_addr, value)?;
        }
        Ok(())
    }

    /// Batched locked unstake: rewards are processed once, all per-stake
    /// effects are folded, and a single transfer (or mint) moves the total.
    pub(crate) fn unstake_locked_multiple<T: Tokens>(
        &mut self,
        user_addr: Address,
        items: &[UnstakeItem],
        is_yield: bool,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<u128> {
        if items.is_empty() {
            return Err(GranaryError::EmptyBatch);
        }
        let vault_due = self.begin_op(user_addr, now, view, events)?;

        let pool_token = self.pool_token;
        let user = self.users.entry(user_addr).or_default();

        // Plan the whole batch against scratch balances first so a failing
        // item leaves nothing half-applied (duplicate ids included).
        let mut remaining: BTreeMap<usize, u128> = BTreeMap::new();
        let mut total_value: u128 = 0;
        let mut total_weight: u128 = 0;
        for item in items {
            if item.value == 0 {
                return Err(GranaryError::ZeroValue);
            }
            let stake = user
                .stakes
                .get(item.stake_id)
                .copied()
                .ok_or(GranaryError::UnknownStake)?;
            if stake.is_yield != is_yield {
                return Err(GranaryError::YieldFlagMismatch);
            }
            if stake.is_locked(now) {
                return Err(GranaryError::StillLocked);
            }
            let rem = remaining.entry(item.stake_id).or_insert(stake.value);
            if item.value > *rem {
                return Err(GranaryError::ValueExceedsStake);
            }
            *rem -= item.value;
            total_weight = add_u128(
                total_weight,
                mul_u128(
                    lock_multiplier(stake.locked_from, stake.locked_until)?,
                    item.value,
                    "unstake_weight",
                )?,
                "batch_weight",
            )?;
            total_value = add_u128(total_value, item.value, "batch_value")?;
        }

        for (stake_id, rem) in &remaining {
            user.stakes[*stake_id].value = *rem;
        }
        user.total_weight = sub_u128(user.total_weight, total_weight, "user_weight")?;
        for item in items {
            events.push(Event::UnstakedLocked {
                pool: pool_token,
                user: user_addr,
                stake_id: item.stake_id,
                value: item.value,
                is_yield,
            });
        }
        self.global_weight = sub_u128(self.global_weight, total_weight, "global_weight")?;
        self.pool_token_reserve = sub_u128(self.pool_token_reserve, total_value, "pool_reserve")?;
        self.finish_op(user_addr, vault_due, tokens)?;
        if is_yield {
            tokens.mint(self.reward_token, user_addr, total_value)?;
        } else {
            tokens.transfer(self.pool_token, self.address, user_addr, total_value)?;
        }
        Ok(total_value)
    }

    // ---- lock extension --------------------------------------------------

    /// Extend a stake's lock. The interval is rebased to start at `now`, so
    /// the cap is `now + MAX_LOCK` regardless of the previous `locked_from`.
    pub(crate) fn update_stake_lock<T: Tokens>(
        &mut self,
        user_addr: Address,
        stake_id: usize,
        new_until: Timestamp,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let vault_due = self.begin_op(user_addr, now, view, events)?;

        let pool_token = self.pool_token;
        let user = self.users.entry(user_addr).or_default();
        let stake = user
            .stakes
            .get(stake_id)
            .copied()
            .ok_or(GranaryError::UnknownStake)?;
        if !stake.is_live() {
            return Err(GranaryError::UnknownStake);
        }
        if new_until <= now || new_until <= stake.locked_until {
            return Err(GranaryError::InvalidLockExtension);
        }
        if new_until - now > MAX_LOCK {
            return Err(GranaryError::InvalidLockExtension);
        }
        let old_weight = stake.weight()?;
        let updated = Stake {
            locked_from: now,
            locked_until: new_until,
            ..stake
        };
        let new_weight = updated.weight()?;

        user.stakes[stake_id] = updated;
        if new_weight >= old_weight {
            let delta = new_weight - old_weight;
            user.total_weight = add_u128(user.total_weight, delta, "user_weight")?;
            self.global_weight = add_u128(self.global_weight, delta, "global_weight")?;
        } else {
            let delta = old_weight - new_weight;
            user.total_weight = sub_u128(user.total_weight, delta, "user_weight")?;
            self.global_weight = sub_u128(self.global_weight, delta, "global_weight")?;
        }
        events.push(Event::LockExtended {
            pool: pool_token,
            user: user_addr,
            stake_id,
            locked_from: now,
            locked_until: new_until,
        });
        self.finish_op(user_addr, vault_due, tokens)
    }

    // ---- claiming --------------------------------------------------------

    /// Claim the caller's crystallised yield.
    ///
    /// With `use_escrow` the escrow token is minted immediately; otherwise the
    /// reward-token pool compounds the amount into a max-lock yield stake and
    /// any other pool reports `Routed` for the factory to forward.
    pub(crate) fn claim_yield<T: Tokens>(
        &mut self,
        user_addr: Address,
        use_escrow: bool,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<ClaimRoute> {
        let vault_due = self.begin_op(user_addr, now, view, events)?;
        let pending = {
            let user = self.users.entry(user_addr).or_default();
            std::mem::take(&mut user.pending_yield)
        };
        if pending == 0 {
            self.finish_op(user_addr, vault_due, tokens)?;
            return Ok(ClaimRoute::Nothing);
        }
        tracing::debug!(pool = %self.pool_token, user = %user_addr, pending, use_escrow, "claiming yield");
        if use_escrow {
            self.finish_op(user_addr, vault_due, tokens)?;
            tokens.mint(self.escrow_token, user_addr, pending)?;
            Ok(ClaimRoute::Escrowed(pending))
        } else if self.pool_token == self.reward_token {
            let stake_id = self.append_yield_stake(user_addr, pending, now)?;
            events.push(Event::StakedLocked {
                pool: self.pool_token,
                user: user_addr,
                stake_id,
                value: pending,
                locked_until: now + MAX_LOCK,
            });
            self.finish_op(user_addr, vault_due, tokens)?;
            Ok(ClaimRoute::Compounded(pending))
        } else {
            self.finish_op(user_addr, vault_due, tokens)?;
            Ok(ClaimRoute::Routed(pending))
        }
    }

    /// Entry used by sibling pools to compound a user's claimed yield into
    /// this (reward-token) pool on the user's behalf.
    pub(crate) fn stake_as_pool<T: Tokens>(
        &mut self,
        user_addr: Address,
        value: u128,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<usize> {
        let vault_due = self.begin_op(user_addr, now, view, events)?;
        let stake_id = self.append_yield_stake(user_addr, value, now)?;
        events.push(Event::StakedLocked {
            pool: self.pool_token,
            user: user_addr,
            stake_id,
            value,
            locked_until: now + MAX_LOCK,
        });
        self.finish_op(user_addr, vault_due, tokens)?;
        Ok(stake_id)
    }

    /// Open a max-lock `is_yield` stake. No token moves: the value is owed
    /// and will be materialised by minting on unstake, so the reserve is
    /// credited here.
    fn append_yield_stake(
        &mut self,
        user_addr: Address,
        value: u128,
        now: Timestamp,
    ) -> Result<usize> {
        let locked_until = now
            .checked_add(MAX_LOCK)
            .ok_or(GranaryError::Overflow("yield_lock"))?;
        let weight = mul_u128(YEAR_WEIGHT_MULT, value, "yield_weight")?;
        let user = self.users.entry(user_addr).or_default();
        let stake_id = user.stakes.len();
        user.stakes.push(Stake {
            value,
            locked_from: now,
            locked_until,
            is_yield: true,
        });
        user.total_weight = add_u128(user.total_weight, weight, "user_weight")?;
        self.global_weight = add_u128(self.global_weight, weight, "global_weight")?;
        self.pool_token_reserve = add_u128(self.pool_token_reserve, value, "pool_reserve")?;
        Ok(stake_id)
    }

    // ---- user migration --------------------------------------------------

    /// Move a user's aggregates wholesale to a fresh record.
    ///
    /// The source's stake entries survive as tombstones so positional ids
    /// stay valid. v1 bookkeeping intentionally stays behind (the legacy
    /// bonus stops accruing to the migrated-to record).
    pub(crate) fn migrate_user<T: Tokens>(
        &mut self,
        from: Address,
        to: Address,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        if to.is_zero() {
            return Err(GranaryError::ZeroAddress);
        }
        let vault_due = self.begin_op(from, now, view, events)?;
        if let Some(dest) = self.users.get(&to) {
            if dest.total_weight != 0
                || !dest.v1_stake_ids.is_empty()
                || dest.pending_yield != 0
                || !dest.stakes.is_empty()
            {
                return Err(GranaryError::DestinationNotEmpty);
            }
        }
        let yield_rpw = self.yield_rewards_per_weight;
        let vault_rpw = self.vault_rewards_per_weight;

        let (stakes, flexible, weight, pending) = {
            let src = self.users.entry(from).or_default();
            let stakes = std::mem::take(&mut src.stakes);
            src.stakes = stakes.iter().map(|s| Stake { value: 0, ..*s }).collect();
            (
                stakes,
                std::mem::take(&mut src.flexible_balance),
                std::mem::take(&mut src.total_weight),
                std::mem::take(&mut src.pending_yield),
            )
        };
        let dest = self.users.entry(to).or_default();
        dest.stakes = stakes;
        dest.flexible_balance = flexible;
        dest.total_weight = weight;
        dest.pending_yield = pending;
        dest.sub_yield_rewards = weight_to_reward(weight, yield_rpw)?;
        dest.sub_vault_rewards = weight_to_reward(weight, vault_rpw)?;
        events.push(Event::UserMigrated {
            pool: self.pool_token,
            from,
            to,
        });
        tracing::info!(pool = %self.pool_token, %from, %to, "user migrated");
        self.finish_op(from, vault_due, tokens)
    }

    // ---- views -----------------------------------------------------------

    /// Pending rewards with the yield accumulator virtually advanced to
    /// `now` and the v1 bonus applied to the user's weight.
    pub fn pending_rewards(
        &self,
        user_addr: Address,
        now: Timestamp,
        view: &EmissionView,
    ) -> Result<PendingRewards> {
        let mut yield_rpw = self.yield_rewards_per_weight;
        if self.global_weight > 0
            && self.last_yield_distribution < view.end_time
            && now > self.last_yield_distribution
        {
            let cap = now.min(view.end_time);
            let elapsed = (cap - self.last_yield_distribution) as u128;
            let reward = self.interval_reward(elapsed, view)?;
            if reward > 0 {
                yield_rpw = add_u128(
                    yield_rpw,
                    reward_per_weight(reward, self.global_weight)?,
                    "pending_accumulator",
                )?;
            }
        }
        let user = match self.users.get(&user_addr) {
            Some(u) => u,
            None => return Ok(PendingRewards::default()),
        };
        let effective = user.effective_weight()?;
        let yield_rewards = add_u128(
            sub_u128(
                weight_to_reward(effective, yield_rpw)?,
                user.sub_yield_rewards,
                "pending_yield_view",
            )?,
            user.pending_yield,
            "pending_yield_view",
        )?;
        let vault_rewards = sub_u128(
            weight_to_reward(effective, self.vault_rewards_per_weight)?,
            user.sub_vault_rewards,
            "pending_vault_view",
        )?;
        Ok(PendingRewards {
            yield_rewards,
            vault_rewards,
        })
    }

    /// Overwrite the pool's emission weight. Factory-only entry.
    ///
    /// The weight field is overwritten before the change event is formed, so
    /// the event carries the new value in both fields.
    pub(crate) fn set_weight(&mut self, new_weight: u32, events: &mut Vec<Event>) {
        self.weight = new_weight;
        events.push(Event::PoolWeightChanged {
            pool: self.pool_token,
            from: self.weight,
            to: new_weight,
        });
    }
}
