//! End-to-end engine scenarios exercised through the public surface only.

use granary_core::math::{MAX_LOCK, WEIGHT_MULT};
use granary_core::{
    check_pool, Address, EngineConfig, GranaryError, InMemoryLedger, ManualClock, PoolConfig,
    PoolFactory, StaticV1Pool, Timestamp, TokenId, Tokens, V1Deposit,
};

const INIT: Timestamp = 1_000_000;

fn addr(b: u8) -> Address {
    Address([b; 32])
}

fn token(b: u8) -> TokenId {
    TokenId([b; 32])
}

fn owner() -> Address {
    addr(1)
}

fn reward_token() -> TokenId {
    token(10)
}

fn escrow_token() -> TokenId {
    token(11)
}

fn lp_token() -> TokenId {
    token(12)
}

fn engine(rate: u128, seconds_per_update: u64) -> PoolFactory<ManualClock, InMemoryLedger> {
    let config = EngineConfig::builder()
        .owner(owner())
        .factory_address(addr(2))
        .reward_token(reward_token())
        .escrow_token(escrow_token())
        .reward_per_second(rate)
        .seconds_per_update(seconds_per_update)
        .end_time(INIT + 100_000_000)
        .build()
        .unwrap();
    PoolFactory::new(config, ManualClock::new(INIT), InMemoryLedger::new()).unwrap()
}

fn register(
    f: &mut PoolFactory<ManualClock, InMemoryLedger>,
    pool_token: TokenId,
    pool_address: Address,
    weight: u32,
) {
    f.register_pool(
        owner(),
        PoolConfig {
            pool_token,
            pool_address,
            weight,
            is_flash: false,
            v1_stake_max_period: INIT,
        },
    )
    .unwrap();
}

fn fund(f: &mut PoolFactory<ManualClock, InMemoryLedger>, t: TokenId, who: Address, v: u128) {
    f.tokens_mut().mint(t, who, v).unwrap();
}

#[test]
fn two_stakers_one_lock_conserves_emission() {
    let mut f = engine(1_000, 1_000_000_000);
    register(&mut f, reward_token(), addr(100), 200);
    let alice = addr(3);
    let bob = addr(4);
    fund(&mut f, reward_token(), alice, 1_000);
    fund(&mut f, reward_token(), bob, 10_000);

    f.stake_flexible(alice, reward_token(), 10).unwrap();
    f.clock_mut().advance(50);
    f.stake_and_lock(bob, reward_token(), 5_000, INIT + 50 + MAX_LOCK)
        .unwrap();
    f.clock_mut().set(INIT + 200);

    let alice_claim = f.claim_rewards(alice, reward_token(), true).unwrap();
    let bob_claim = f.claim_rewards(bob, reward_token(), true).unwrap();
    assert_eq!(alice_claim, 50_149);
    assert_eq!(bob_claim, 149_850);

    // 200s * 1000/s was emitted; truncation loses at most one unit per
    // claimant.
    let emitted = 200 * 1_000;
    let claimed = alice_claim + bob_claim;
    assert!(claimed <= emitted);
    assert!(emitted - claimed <= 2);

    check_pool(f.pool(reward_token()).unwrap()).unwrap();
}

#[test]
fn compound_claim_then_unstake_mints_the_yield() {
    let mut f = engine(1_000, 1_000_000_000);
    register(&mut f, reward_token(), addr(100), 200);
    let alice = addr(3);
    fund(&mut f, reward_token(), alice, 1_000);

    f.stake_and_lock(alice, reward_token(), 100, INIT + MAX_LOCK)
        .unwrap();
    f.clock_mut().advance(100);
    let claimed = f.claim_rewards(alice, reward_token(), false).unwrap();
    assert_eq!(claimed, 100_000);

    let stake = f.get_stake(reward_token(), alice, 1).unwrap();
    assert!(stake.is_yield);
    assert_eq!(stake.locked_until, INIT + 100 + MAX_LOCK);
    assert_eq!(
        f.pool(reward_token()).unwrap().pool_token_reserve(),
        100 + 100_000
    );

    // After the yield lock expires the stake is minted out, not transferred.
    f.clock_mut().set(INIT + 100 + MAX_LOCK + 1);
    let pool_balance_before = f.tokens().balance_of(reward_token(), addr(100));
    f.unstake_locked(alice, reward_token(), 1, 100_000).unwrap();
    assert_eq!(f.tokens().balance_of(reward_token(), alice), 900 + 100_000);
    // The pool's own holdings did not move for a minted unstake.
    assert_eq!(
        f.tokens().balance_of(reward_token(), addr(100)),
        pool_balance_before
    );
    assert_eq!(f.pool(reward_token()).unwrap().pool_token_reserve(), 100);
    check_pool(f.pool(reward_token()).unwrap()).unwrap();
}

#[test]
fn emission_caps_at_end_time_for_late_claims() {
    let mut f = engine(1_000, 1_000_000_000);
    register(&mut f, reward_token(), addr(100), 200);
    f.set_end_time(owner(), INIT + 100).unwrap();
    let alice = addr(3);
    fund(&mut f, reward_token(), alice, 1_000);
    f.stake_flexible(alice, reward_token(), 100).unwrap();

    for k in [0u64, 1, 500, 1_000_000] {
        f.clock_mut().set(INIT + 100 + k);
        assert_eq!(
            f.pending_rewards(reward_token(), alice).unwrap().yield_rewards,
            100_000,
            "yield must freeze at end_time (k = {k})"
        );
    }
    assert_eq!(f.claim_rewards(alice, reward_token(), true).unwrap(), 100_000);
    assert_eq!(f.claim_rewards(alice, reward_token(), true).unwrap(), 0);
}

#[test]
fn decay_chain_compounds_three_percent_steps() {
    let mut f = engine(1_000_000, 100);
    register(&mut f, reward_token(), addr(100), 200);

    for expected in [970_000u128, 940_900, 912_673] {
        f.clock_mut().advance(100);
        f.update_reward_per_second().unwrap();
        assert_eq!(f.emission().reward_per_second, expected);
    }
    assert_eq!(f.update_reward_per_second(), Err(GranaryError::TooSoon));
}

#[test]
fn identical_histories_claim_identically() {
    let mut f = engine(1_000, 1_000_000_000);
    register(&mut f, reward_token(), addr(100), 200);
    let alice = addr(3);
    let bob = addr(4);
    fund(&mut f, reward_token(), alice, 1_000);
    fund(&mut f, reward_token(), bob, 1_000);

    f.stake_flexible(alice, reward_token(), 333).unwrap();
    f.stake_flexible(bob, reward_token(), 333).unwrap();
    f.clock_mut().advance(101);

    let a = f.claim_rewards(alice, reward_token(), true).unwrap();
    let b = f.claim_rewards(bob, reward_token(), true).unwrap();
    assert!(a.abs_diff(b) <= 1, "a = {a}, b = {b}");
}

#[test]
fn frequent_syncs_lose_only_bounded_dust() {
    let mut sparse = engine(10, 1_000_000_000);
    register(&mut sparse, reward_token(), addr(100), 200);
    let mut dense = engine(10, 1_000_000_000);
    register(&mut dense, reward_token(), addr(100), 200);
    let alice = addr(3);
    fund(&mut sparse, reward_token(), alice, 1_000);
    fund(&mut dense, reward_token(), alice, 1_000);

    sparse.stake_flexible(alice, reward_token(), 3).unwrap();
    dense.stake_flexible(alice, reward_token(), 3).unwrap();

    for _ in 0..10 {
        dense.clock_mut().advance(1);
        dense.sync(reward_token()).unwrap();
    }
    sparse.clock_mut().advance(10);
    sparse.sync(reward_token()).unwrap();

    let s = sparse.claim_rewards(alice, reward_token(), true).unwrap();
    let d = dense.claim_rewards(alice, reward_token(), true).unwrap();
    assert!(d <= s);
    assert!(s - d <= 10, "sparse = {s}, dense = {d}");
}

#[test]
fn deflationary_lp_pool_routes_claims_to_reward_pool() {
    let mut f = engine(1_000, 1_000_000_000);
    register(&mut f, reward_token(), addr(100), 100);
    register(&mut f, lp_token(), addr(101), 100);
    f.tokens_mut().set_transfer_fee(lp_token(), 200); // 2%
    let alice = addr(3);
    fund(&mut f, lp_token(), alice, 10_000);

    let credited = f.stake_flexible(alice, lp_token(), 1_000).unwrap();
    assert_eq!(credited, 980);
    assert_eq!(
        f.pool(lp_token()).unwrap().global_weight(),
        980 * WEIGHT_MULT
    );

    f.clock_mut().advance(200);
    // Half the emission (100_000) flows to the LP pool; one unit is lost to
    // accumulator truncation over the 980e6 weight. The claim compounds into
    // the reward pool as a yield stake.
    let claimed = f.claim_rewards(alice, lp_token(), false).unwrap();
    assert_eq!(claimed, 99_999);
    let stake = f.get_stake(reward_token(), alice, 0).unwrap();
    assert!(stake.is_yield);
    assert_eq!(stake.value, 99_999);

    // Unstaking the LP principal returns the fee-reduced amount less the
    // outbound fee.
    f.unstake_flexible(alice, lp_token(), 980).unwrap();
    assert_eq!(
        f.tokens().balance_of(lp_token(), alice),
        9_000 + 980 - 980 * 2 / 100
    );
    check_pool(f.pool(lp_token()).unwrap()).unwrap();
    check_pool(f.pool(reward_token()).unwrap()).unwrap();
}

#[test]
fn v1_migration_walkthrough() {
    let mut f = engine(1_000, 1_000_000_000);
    register(&mut f, reward_token(), addr(100), 200);

    let alice = addr(3);
    let mut v1 = StaticV1Pool::new();
    v1.set_deposit(
        alice,
        42,
        V1Deposit {
            value: 50,
            weight: 100 * WEIGHT_MULT,
            locked_from: INIT - 1_000,
            locked_until: INIT + 1_000,
            is_yield: false,
        },
    );
    v1.set_deposit(
        alice,
        43,
        V1Deposit {
            value: 600,
            weight: 1_200 * WEIGHT_MULT,
            locked_from: INIT - MAX_LOCK,
            locked_until: INIT - 1,
            is_yield: true,
        },
    );
    v1.set_totals(1_000_000, 10_000 * WEIGHT_MULT);
    f.set_v1_pool(owner(), reward_token(), Box::new(v1)).unwrap();

    fund(&mut f, reward_token(), alice, 1_000);
    f.stake_flexible(alice, reward_token(), 100).unwrap();

    // Reference the locked v1 stake: triple-counted weight in rewards only.
    f.migrate_locked_stake(alice, reward_token(), &[42]).unwrap();
    let user = f.user(reward_token(), alice).unwrap();
    assert_eq!(user.total_weight, 100 * WEIGHT_MULT);
    assert_eq!(user.v1_bonus_weight().unwrap(), 300 * WEIGHT_MULT);
    assert_eq!(
        f.pool(reward_token()).unwrap().global_weight(),
        100 * WEIGHT_MULT
    );

    // 100s of emission at effective weight 400e6 over a 100e6 global weight.
    f.clock_mut().advance(100);
    assert_eq!(
        f.pending_rewards(reward_token(), alice).unwrap().yield_rewards,
        400_000
    );

    // Mint the matured v1 yield stake.
    let minted = f.mint_v1_yield(alice, reward_token(), 43).unwrap();
    assert_eq!(minted, 600);

    // Mature and materialise the referenced stake.
    f.clock_mut().set(INIT + 1_001);
    let filled_id = f.fill_stake_id(alice, reward_token(), 0).unwrap();
    let user = f.user(reward_token(), alice).unwrap();
    assert_eq!(user.v1_bonus_weight().unwrap(), 0);
    let filled = f.get_stake(reward_token(), alice, filled_id).unwrap();
    assert_eq!(filled.value, 50);
    assert!(filled.is_yield);

    f.unstake_locked(alice, reward_token(), filled_id, 50).unwrap();
    check_pool(f.pool(reward_token()).unwrap()).unwrap();
}

#[test]
fn events_record_the_session() {
    use granary_core::Event;

    let mut f = engine(1_000, 1_000_000_000);
    register(&mut f, reward_token(), addr(100), 200);
    let alice = addr(3);
    fund(&mut f, reward_token(), alice, 1_000);
    f.stake_flexible(alice, reward_token(), 100).unwrap();
    f.clock_mut().advance(10);
    f.claim_rewards(alice, reward_token(), true).unwrap();

    let events = f.take_events();
    assert!(matches!(events[0], Event::PoolRegistered { weight: 200, .. }));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::StakedFlexible { value: 100, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RewardsClaimed {
            value: 10_000,
            escrow: true,
            ..
        }
    )));
    // Draining leaves the log empty.
    assert!(f.events().is_empty());
}
