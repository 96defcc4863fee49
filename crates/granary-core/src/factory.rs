//! The pool factory: emission schedule, pool registry, and the public
//! operation surface.
//!
//! The factory owns pools one-directionally. Pools never call back into the
//! factory; each operation snapshots the emission state into an
//! [`EmissionView`] and hands it down, which keeps the ownership graph
//! acyclic and every operation a single linearised transaction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::events::Event;
use crate::math::{mul_div_floor_u128, RATIO_DECAY_DENOMINATOR, RATIO_DECAY_NUMERATOR};
use crate::migrator::V1PoolView;
use crate::pool::{ClaimRoute, Pool};
use crate::types::{EmissionView, PendingRewards, PoolConfig, PoolData, Stake, UnstakeItem, User};
use crate::{Address, Clock, GranaryError, Result, Timestamp, TokenId, Tokens};

/// Global emission state: the reward rate and its geometric decay schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionSchedule {
    pub reward_per_second: u128,
    pub seconds_per_update: u64,
    pub last_ratio_update: Timestamp,
    pub end_time: Timestamp,
}

impl EmissionSchedule {
    /// A decay is due once per `seconds_per_update`, and never past the end.
    pub fn should_update_ratio(&self, now: Timestamp) -> bool {
        now <= self.end_time
            && now >= self.last_ratio_update.saturating_add(self.seconds_per_update)
    }

    /// Apply one 3% decay step: `rate := rate * 97 / 100`.
    pub(crate) fn update_reward_per_second(&mut self, now: Timestamp) -> Result<(u128, u128)> {
        if !self.should_update_ratio(now) {
            return Err(GranaryError::TooSoon);
        }
        let previous = self.reward_per_second;
        self.reward_per_second = mul_div_floor_u128(
            previous,
            RATIO_DECAY_NUMERATOR,
            RATIO_DECAY_DENOMINATOR,
            "ratio_decay",
        )?;
        self.last_ratio_update = now;
        Ok((previous, self.reward_per_second))
    }
}

/// Engine root: registry of pools plus the global emission authority.
pub struct PoolFactory<C: Clock, T: Tokens> {
    pub(crate) config: EngineConfig,
    pub(crate) emission: EmissionSchedule,
    pub(crate) total_pool_weight: u32,
    pub(crate) vault: Address,
    pub(crate) pools: BTreeMap<TokenId, Pool>,
    pub(crate) pool_addresses: BTreeMap<Address, TokenId>,
    pub(crate) v1_pools: BTreeMap<TokenId, Box<dyn V1PoolView>>,
    pub(crate) clock: C,
    pub(crate) tokens: T,
    pub(crate) events: Vec<Event>,
}

impl<C: Clock, T: Tokens> PoolFactory<C, T> {
    pub fn new(config: EngineConfig, clock: C, tokens: T) -> Result<PoolFactory<C, T>> {
        config.validate()?;
        let now = clock.now();
        Ok(PoolFactory {
            emission: EmissionSchedule {
                reward_per_second: config.reward_per_second,
                seconds_per_update: config.seconds_per_update,
                last_ratio_update: now,
                end_time: config.end_time,
            },
            config,
            total_pool_weight: 0,
            vault: Address::ZERO,
            pools: BTreeMap::new(),
            pool_addresses: BTreeMap::new(),
            v1_pools: BTreeMap::new(),
            clock,
            tokens,
            events: Vec::new(),
        })
    }

    // ---- accessors -------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn emission(&self) -> EmissionSchedule {
        self.emission
    }

    pub fn total_pool_weight(&self) -> u32 {
        self.total_pool_weight
    }

    pub fn vault(&self) -> Address {
        self.vault
    }

    pub fn pool(&self, pool_token: TokenId) -> Option<&Pool> {
        self.pools.get(&pool_token)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn tokens(&self) -> &T {
        &self.tokens
    }

    pub fn tokens_mut(&mut self) -> &mut T {
        &mut self.tokens
    }

    fn emission_view(&self) -> EmissionView {
        EmissionView {
            reward_per_second: self.emission.reward_per_second,
            total_pool_weight: self.total_pool_weight,
            end_time: self.emission.end_time,
        }
    }

    // ---- emission --------------------------------------------------------

    pub fn should_update_ratio(&self) -> bool {
        self.emission.should_update_ratio(self.clock.now())
    }

    /// Explicitly apply the next emission decay step.
    pub fn update_reward_per_second(&mut self) -> Result<()> {
        let now = self.clock.now();
        let (previous, current) = self.emission.update_reward_per_second(now)?;
        tracing::debug!(previous, current, "reward per second decayed");
        self.events
            .push(Event::RewardPerSecondUpdated { previous, current });
        Ok(())
    }

    /// Apply a due decay (if any), then snapshot the emission state. Runs
    /// before every pool sync so the first second after a decay already
    /// integrates at the decayed rate.
    pub(crate) fn advance_emission(&mut self, now: Timestamp) -> EmissionView {
        if self.emission.should_update_ratio(now) {
            if let Ok((previous, current)) = self.emission.update_reward_per_second(now) {
                tracing::debug!(previous, current, "reward per second decayed");
                self.events
                    .push(Event::RewardPerSecondUpdated { previous, current });
            }
        }
        self.emission_view()
    }

    // ---- administration --------------------------------------------------

    /// Register (or overwrite) a pool. Owner-only.
    ///
    /// There is no duplicate protection beyond the map overwrite:
    /// re-registering a pool token replaces the entry but still adds the new
    /// weight to the total.
    pub fn register_pool(&mut self, caller: Address, spec: PoolConfig) -> Result<()> {
        if caller != self.config.owner {
            return Err(GranaryError::AccessDenied);
        }
        if spec.pool_address.is_zero() {
            return Err(GranaryError::ZeroAddress);
        }
        if spec.pool_token.is_zero() {
            return Err(GranaryError::ConfigError("pool token must be set".into()));
        }
        let now = self.clock.now();
        let pool = Pool::new(&spec, self.config.reward_token, self.config.escrow_token, now);
        self.total_pool_weight = self
            .total_pool_weight
            .checked_add(spec.weight)
            .ok_or(GranaryError::Overflow("total_pool_weight"))?;
        self.pools.insert(spec.pool_token, pool);
        self.pool_addresses.insert(spec.pool_address, spec.pool_token);
        tracing::info!(
            pool = %spec.pool_token,
            address = %spec.pool_address,
            weight = spec.weight,
            "pool registered"
        );
        self.events.push(Event::PoolRegistered {
            pool_token: spec.pool_token,
            pool_address: spec.pool_address,
            weight: spec.weight,
        });
        Ok(())
    }

    /// Attach a read-only legacy pool to an already-registered pool.
    /// Owner-only.
    pub fn set_v1_pool(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        view: Box<dyn V1PoolView>,
    ) -> Result<()> {
        if caller != self.config.owner {
            return Err(GranaryError::AccessDenied);
        }
        if !self.pools.contains_key(&pool_token) {
            return Err(GranaryError::UnknownPool);
        }
        self.v1_pools.insert(pool_token, view);
        Ok(())
    }

    /// Re-weight a pool's emission share. Owner or the pool itself.
    ///
    /// Setting the weight to zero disables a pool without withdrawing
    /// deposits.
    pub fn change_pool_weight(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        new_weight: u32,
    ) -> Result<()> {
        let (pool_address, old_weight) = {
            let pool = self.pools.get(&pool_token).ok_or(GranaryError::UnknownPool)?;
            (pool.address, pool.weight)
        };
        if caller != self.config.owner && caller != pool_address {
            return Err(GranaryError::AccessDenied);
        }
        self.total_pool_weight = self
            .total_pool_weight
            .checked_sub(old_weight)
            .and_then(|t| t.checked_add(new_weight))
            .ok_or(GranaryError::Overflow("total_pool_weight"))?;
        tracing::info!(pool = %pool_token, old_weight, new_weight, "pool weight changed");
        let Self { pools, events, .. } = self;
        if let Some(pool) = pools.get_mut(&pool_token) {
            pool.set_weight(new_weight, events);
        }
        Ok(())
    }

    /// Pool-surface weight overwrite; only the factory identity may call.
    pub fn set_pool_weight(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        new_weight: u32,
    ) -> Result<()> {
        if caller != self.config.factory_address {
            return Err(GranaryError::NotFactory);
        }
        let Self { pools, events, .. } = self;
        let pool = pools.get_mut(&pool_token).ok_or(GranaryError::UnknownPool)?;
        pool.set_weight(new_weight, events);
        Ok(())
    }

    /// Move the emission end. Owner-only; must lie beyond the last decay.
    pub fn set_end_time(&mut self, caller: Address, end_time: Timestamp) -> Result<()> {
        if caller != self.config.owner {
            return Err(GranaryError::AccessDenied);
        }
        if end_time <= self.emission.last_ratio_update {
            return Err(GranaryError::ConfigError(
                "end_time must exceed the last ratio update".into(),
            ));
        }
        let previous = self.emission.end_time;
        self.emission.end_time = end_time;
        tracing::info!(previous, current = end_time, "emission end time updated");
        self.events.push(Event::EndTimeUpdated {
            previous,
            current: end_time,
        });
        Ok(())
    }

    /// Mint the reward token (or its escrowed variant) on behalf of a pool.
    /// The caller must be a registered pool address.
    pub fn mint_yield_to(
        &mut self,
        caller: Address,
        to: Address,
        value: u128,
        use_escrow: bool,
    ) -> Result<()> {
        if !self.pool_addresses.contains_key(&caller) {
            return Err(GranaryError::AccessDenied);
        }
        let token = if use_escrow {
            self.config.escrow_token
        } else {
            self.config.reward_token
        };
        self.tokens.mint(token, to, value)
    }

    // ---- registry views --------------------------------------------------

    pub fn get_pool_address(&self, pool_token: TokenId) -> Option<Address> {
        self.pools.get(&pool_token).map(|p| p.address)
    }

    pub fn get_pool_data(&self, pool_token: TokenId) -> Result<PoolData> {
        let pool = self.pools.get(&pool_token).ok_or(GranaryError::UnknownPool)?;
        Ok(PoolData {
            pool_token: pool.pool_token,
            pool_address: pool.address,
            weight: pool.weight,
            is_flash: pool.is_flash,
        })
    }

    pub fn is_flash_pool(&self, pool_token: TokenId) -> Result<bool> {
        Ok(self
            .pools
            .get(&pool_token)
            .ok_or(GranaryError::UnknownPool)?
            .is_flash)
    }

    pub fn pool_exists(&self, address: Address) -> bool {
        self.pool_addresses.contains_key(&address)
    }

    // ---- pool operations -------------------------------------------------

    /// Run a mutating pool operation under the reentry guard with
    /// rollback-on-error semantics: the emission schedule, the event log and
    /// the touched pool state are restored whole if the operation fails.
    pub(crate) fn mutate_pool<R>(
        &mut self,
        pool_token: TokenId,
        touched: &[Address],
        f: impl FnOnce(&mut Pool, Timestamp, &EmissionView, &mut T, &mut Vec<Event>) -> Result<R>,
    ) -> Result<R> {
        let now = self.clock.now();
        let emission_before = self.emission;
        let events_mark = self.events.len();
        let checkpoint = self
            .pools
            .get(&pool_token)
            .ok_or(GranaryError::UnknownPool)?
            .checkpoint(touched);
        let view = self.advance_emission(now);

        let res = {
            let Self {
                pools,
                tokens,
                events,
                ..
            } = self;
            let pool = pools.get_mut(&pool_token).ok_or(GranaryError::UnknownPool)?;
            match pool.guard_enter() {
                Ok(()) => {
                    let r = f(pool, now, &view, tokens, events);
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

    /// Stake into the unlocked (flexible) balance. Returns the credited
    /// value as measured on receipt.
    pub fn stake_flexible(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        value: u128,
    ) -> Result<u128> {
        self.mutate_pool(pool_token, &[caller], |pool, now, view, tokens, events| {
            pool.stake_flexible(caller, value, now, view, tokens, events)
        })
    }

    /// Stake with an optional lock (`locked_until == 0` appends an unlocked
    /// entry). Returns the new stake id.
    pub fn stake_and_lock(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        value: u128,
        locked_until: Timestamp,
    ) -> Result<usize> {
        self.mutate_pool(pool_token, &[caller], |pool, now, view, tokens, events| {
            pool.stake_and_lock(caller, value, locked_until, now, view, tokens, events)
        })
    }

    pub fn unstake_flexible(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        value: u128,
    ) -> Result<()> {
        self.mutate_pool(pool_token, &[caller], |pool, now, view, tokens, events| {
            pool.unstake_flexible(caller, value, now, view, tokens, events)
        })
    }

    pub fn unstake_locked(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        stake_id: usize,
        value: u128,
    ) -> Result<()> {
        self.mutate_pool(pool_token, &[caller], |pool, now, view, tokens, events| {
            pool.unstake_locked(caller, stake_id, value, now, view, tokens, events)
        })
    }

    /// Unstake several matured stakes in one pass; rewards are processed
    /// once and a single transfer (or mint) moves the total.
    pub fn unstake_locked_multiple(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        items: &[UnstakeItem],
        is_yield: bool,
    ) -> Result<u128> {
        self.mutate_pool(pool_token, &[caller], |pool, now, view, tokens, events| {
            pool.unstake_locked_multiple(caller, items, is_yield, now, view, tokens, events)
        })
    }

    pub fn update_stake_lock(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        stake_id: usize,
        locked_until: Timestamp,
    ) -> Result<()> {
        self.mutate_pool(pool_token, &[caller], |pool, now, view, tokens, events| {
            pool.update_stake_lock(caller, stake_id, locked_until, now, view, tokens, events)
        })
    }

    /// Bring a pool's accumulator up to `now`.
    pub fn sync(&mut self, pool_token: TokenId) -> Result<()> {
        if !self.pools.contains_key(&pool_token) {
            return Err(GranaryError::UnknownPool);
        }
        let now = self.clock.now();
        let view = self.advance_emission(now);
        let Self { pools, events, .. } = self;
        let pool = pools.get_mut(&pool_token).ok_or(GranaryError::UnknownPool)?;
        pool.sync(now, &view, events)
    }

    /// Claim the caller's accrued yield: escrow mint, in-pool compounding,
    /// or routing into the reward-token pool, depending on the pool and
    /// `use_escrow`.
    pub fn claim_rewards(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        use_escrow: bool,
    ) -> Result<u128> {
        self.claim_for(caller, pool_token, use_escrow)
    }

    /// Router entry: the reward-token pool claims on behalf of `staker`.
    /// Only the caller identity is authenticated; the staker argument is
    /// taken as-is.
    pub fn claim_rewards_from_router(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        staker: Address,
        use_escrow: bool,
    ) -> Result<u128> {
        let router = self
            .pools
            .get(&self.config.reward_token)
            .ok_or(GranaryError::UnknownPool)?
            .address;
        if caller != router {
            return Err(GranaryError::NotRouter);
        }
        self.claim_for(staker, pool_token, use_escrow)
    }

    /// Compound `value` into a max-lock yield stake in the reward-token pool
    /// on behalf of `staker`. The caller must be a registered pool address.
    pub fn stake_as_pool(&mut self, caller: Address, staker: Address, value: u128) -> Result<usize> {
        if !self.pool_addresses.contains_key(&caller) {
            return Err(GranaryError::AccessDenied);
        }
        if value == 0 {
            return Err(GranaryError::ZeroValue);
        }
        let reward_token = self.config.reward_token;
        self.mutate_pool(reward_token, &[staker], |pool, now, view, tokens, events| {
            pool.stake_as_pool(staker, value, now, view, tokens, events)
        })
    }

    fn claim_for(&mut self, staker: Address, pool_token: TokenId, use_escrow: bool) -> Result<u128> {
        let now = self.clock.now();
        let emission_before = self.emission;
        let events_mark = self.events.len();
        let source_checkpoint = self
            .pools
            .get(&pool_token)
            .ok_or(GranaryError::UnknownPool)?
            .checkpoint(&[staker]);
        let view = self.advance_emission(now);

        let route = {
            let Self {
                pools,
                tokens,
                events,
                ..
            } = self;
            let pool = pools.get_mut(&pool_token).ok_or(GranaryError::UnknownPool)?;
            match pool.guard_enter() {
                Ok(()) => {
                    let r = pool.claim_yield(staker, use_escrow, now, &view, tokens, events);
                    pool.guard_exit();
                    r
                }
                Err(e) => Err(e),
            }
        };
        let route = match route {
            Ok(route) => route,
            Err(e) => {
                self.emission = emission_before;
                self.events.truncate(events_mark);
                if let Some(pool) = self.pools.get_mut(&pool_token) {
                    pool.restore(source_checkpoint);
                }
                return Err(e);
            }
        };

        // Cross-pool compounding: forward the crystallised amount into the
        // reward-token pool, rolling the source back if the second leg fails.
        if let ClaimRoute::Routed(amount) = route {
            let reward_token = self.config.reward_token;
            let routed = {
                let Self {
                    pools,
                    tokens,
                    events,
                    ..
                } = self;
                match pools.get_mut(&reward_token) {
                    None => Err(GranaryError::UnknownPool),
                    Some(reward_pool) => {
                        let checkpoint = reward_pool.checkpoint(&[staker]);
                        let r = match reward_pool.guard_enter() {
                            Ok(()) => {
                                let r = reward_pool
                                    .stake_as_pool(staker, amount, now, &view, tokens, events);
                                reward_pool.guard_exit();
                                r
                            }
                            Err(e) => Err(e),
                        };
                        if r.is_err() {
                            reward_pool.restore(checkpoint);
                        }
                        r.map(|_| ())
                    }
                }
            };
            if let Err(e) = routed {
                self.emission = emission_before;
                self.events.truncate(events_mark);
                if let Some(pool) = self.pools.get_mut(&pool_token) {
                    pool.restore(source_checkpoint);
                }
                return Err(e);
            }
        }

        let amount = route.amount();
        if amount > 0 {
            self.events.push(Event::RewardsClaimed {
                pool: pool_token,
                user: staker,
                value: amount,
                escrow: matches!(route, ClaimRoute::Escrowed(_)),
            });
        }
        Ok(amount)
    }

    /// Move the caller's aggregates to a fresh record.
    pub fn migrate_user(&mut self, caller: Address, pool_token: TokenId, to: Address) -> Result<()> {
        self.mutate_pool(pool_token, &[caller, to], |pool, now, view, tokens, events| {
            pool.migrate_user(caller, to, now, view, tokens, events)
        })
    }

    // ---- user views ------------------------------------------------------

    pub fn pending_rewards(&self, pool_token: TokenId, user: Address) -> Result<PendingRewards> {
        let pool = self.pools.get(&pool_token).ok_or(GranaryError::UnknownPool)?;
        pool.pending_rewards(user, self.clock.now(), &self.emission_view())
    }

    pub fn balance_of(&self, pool_token: TokenId, user: Address) -> Result<u128> {
        self.pools
            .get(&pool_token)
            .ok_or(GranaryError::UnknownPool)?
            .balance_of(user)
    }

    pub fn user(&self, pool_token: TokenId, user: Address) -> Option<&User> {
        self.pools.get(&pool_token)?.user(user)
    }

    pub fn get_stake(&self, pool_token: TokenId, user: Address, stake_id: usize) -> Option<Stake> {
        self.pools.get(&pool_token)?.get_stake(user, stake_id)
    }

    pub fn get_stakes_length(&self, pool_token: TokenId, user: Address) -> usize {
        self.pools
            .get(&pool_token)
            .map(|p| p.stakes_length(user))
            .unwrap_or(0)
    }

    pub fn get_v1_stake_id(&self, pool_token: TokenId, user: Address, position: usize) -> Option<u128> {
        self.pools.get(&pool_token)?.v1_stake_id(user, position)
    }

    pub fn get_v1_stake_position(
        &self,
        pool_token: TokenId,
        user: Address,
        stake_id: u128,
    ) -> Option<usize> {
        self.pools.get(&pool_token)?.v1_stake_position(user, stake_id)
    }
}
