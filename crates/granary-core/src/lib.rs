//! granary-core: a multi-pool staking and yield-distribution engine.
//!
//! Users deposit pool-specific tokens; the engine accrues a shared global
//! reward emission and distributes it pro-rata to depositors according to a
//! time-weighted share model. Rewards can be claimed as the native reward
//! token (compounded into a long-lock stake) or as a freely-transferable
//! escrowed variant (minted immediately).
//!
//! Design goals:
//! - Deterministic and bounded arithmetic (checked `u128`, floor division)
//! - IO-free core (pure state machine); hosts provide time, tokens and storage
//! - Fail-closed on malformed/unknown inputs (callers validate at boundaries)
//! - Abstract sums over users are never materialised: the
//!   `rewards_per_weight` accumulator keeps every operation O(1) in the number
//!   of depositors

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod events;
pub mod factory;
pub mod invariants;
pub mod ledger;
pub mod math;
pub mod migrator;
pub mod pool;
pub mod types;
pub mod vault;

pub use config::EngineConfig;
pub use events::Event;
pub use factory::{EmissionSchedule, PoolFactory};
pub use invariants::{check_pool, check_user_checkpoint, InvariantId, InvariantViolation};
pub use ledger::InMemoryLedger;
pub use migrator::{StaticV1Pool, V1Deposit, V1PoolView};
pub use pool::Pool;
pub use types::{
    EmissionView, PendingRewards, PoolConfig, PoolData, Stake, UnstakeItem, User,
};

/// Monotonic integer seconds, as reported by the injected [`Clock`].
pub type Timestamp = u64;

/// 32-byte account identifier (user, pool, vault, owner).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub const ZERO: Address = Address([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 32-byte token identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub [u8; 32]);

impl TokenId {
    pub const ZERO: TokenId = TokenId([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Unified error type for all engine operations.
///
/// Every error is fatal to the calling operation and leaves engine state
/// unchanged (validation failures never mutate; later failures roll the
/// touched pool back to its pre-operation checkpoint).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GranaryError {
    #[error("zero value")]
    ZeroValue,

    #[error("zero address")]
    ZeroAddress,

    #[error("lock parameter out of range")]
    InvalidLock,

    #[error("invalid lock extension")]
    InvalidLockExtension,

    #[error("stake is still locked")]
    StillLocked,

    #[error("value exceeds stake")]
    ValueExceedsStake,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("empty batch")]
    EmptyBatch,

    #[error("batch yield flag disagrees with stake")]
    YieldFlagMismatch,

    #[error("migration destination is not empty")]
    DestinationNotEmpty,

    #[error("caller is not the factory")]
    NotFactory,

    #[error("caller is not the router pool")]
    NotRouter,

    #[error("caller is not the vault")]
    NotVault,

    #[error("access denied")]
    AccessDenied,

    #[error("reentrant call")]
    Reentrancy,

    #[error("ratio update not due yet")]
    TooSoon,

    #[error("unknown pool")]
    UnknownPool,

    #[error("unknown stake")]
    UnknownStake,

    #[error("v1 stake already migrated")]
    AlreadyMigrated,

    #[error("v1 stake rejected: {0}")]
    V1StakeRejected(&'static str),

    #[error("no v1 pool configured")]
    V1PoolUnavailable,

    #[error("pool has no active weight")]
    NoActiveWeight,

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("arithmetic underflow in {0}")]
    Underflow(&'static str),

    #[error("token operation failed: {0}")]
    TokenFailure(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

pub type Result<T> = std::result::Result<T, GranaryError>;

/// Time capability: whole seconds, monotone per host guarantees.
///
/// Injected so that engine behaviour is fully deterministic under test and in
/// replicated hosts.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Wall-clock seconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// Deterministic clock driven by the host (or by tests).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManualClock {
    now: Timestamp,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> ManualClock {
        ManualClock { now: start }
    }

    pub fn set(&mut self, now: Timestamp) {
        self.now = now;
    }

    pub fn advance(&mut self, seconds: Timestamp) {
        self.now = self.now.saturating_add(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now
    }
}

/// Token collaborator surface (boundary IO).
///
/// The engine never introspects token internals; deposits are measured as
/// `balance_after - balance_before` so fee-on-transfer tokens are credited at
/// their delivered value. `mint` is trusted engine authority over the reward
/// and escrow tokens only; hosts enforce that at the token layer.
pub trait Tokens {
    fn balance_of(&self, token: TokenId, owner: Address) -> u128;

    fn total_supply(&self, token: TokenId) -> u128;

    fn transfer(&mut self, token: TokenId, from: Address, to: Address, value: u128) -> Result<()>;

    fn mint(&mut self, token: TokenId, to: Address, value: u128) -> Result<()>;
}
