//! Engine configuration.
//!
//! Configuration can be provided programmatically (builder), or loaded from
//! environment variables prefixed with `GRANARY_`:
//!
//! - `GRANARY_OWNER` / `GRANARY_FACTORY_ADDRESS` - 64-char hex addresses
//! - `GRANARY_REWARD_TOKEN` / `GRANARY_ESCROW_TOKEN` - 64-char hex token ids
//! - `GRANARY_REWARD_PER_SECOND` - initial emission rate
//! - `GRANARY_SECONDS_PER_UPDATE` - decay interval in seconds
//! - `GRANARY_END_TIME` - emission end timestamp

use serde::{Deserialize, Serialize};

use crate::{Address, GranaryError, Result, Timestamp, TokenId};

/// Complete engine configuration, validated once at construction.
///
/// After validation the engine treats these values as trusted invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Administrative authority: pool registration, weights, end time, vault.
    pub owner: Address,
    /// Identity the factory presents to pools (`set_weight` caller check).
    pub factory_address: Address,
    /// Native reward token; its pool doubles as the claim router.
    pub reward_token: TokenId,
    /// Mint-only escrowed reward variant, the "liquid" claim option.
    pub escrow_token: TokenId,
    /// Initial emission rate, decayed geometrically over time.
    pub reward_per_second: u128,
    /// Minimum interval between two emission decays.
    pub seconds_per_update: u64,
    /// Emission stops accruing past this timestamp.
    pub end_time: Timestamp,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load configuration from `GRANARY_*` environment variables.
    pub fn from_env() -> Result<EngineConfig> {
        let mut builder = EngineConfig::builder();

        if let Ok(v) = std::env::var("GRANARY_OWNER") {
            builder = builder.owner(Address(parse_hex32("GRANARY_OWNER", &v)?));
        }
        if let Ok(v) = std::env::var("GRANARY_FACTORY_ADDRESS") {
            builder = builder.factory_address(Address(parse_hex32("GRANARY_FACTORY_ADDRESS", &v)?));
        }
        if let Ok(v) = std::env::var("GRANARY_REWARD_TOKEN") {
            builder = builder.reward_token(TokenId(parse_hex32("GRANARY_REWARD_TOKEN", &v)?));
        }
        if let Ok(v) = std::env::var("GRANARY_ESCROW_TOKEN") {
            builder = builder.escrow_token(TokenId(parse_hex32("GRANARY_ESCROW_TOKEN", &v)?));
        }
        if let Ok(v) = std::env::var("GRANARY_REWARD_PER_SECOND") {
            builder = builder.reward_per_second(parse_int("GRANARY_REWARD_PER_SECOND", &v)?);
        }
        if let Ok(v) = std::env::var("GRANARY_SECONDS_PER_UPDATE") {
            builder = builder.seconds_per_update(parse_int("GRANARY_SECONDS_PER_UPDATE", &v)? as u64);
        }
        if let Ok(v) = std::env::var("GRANARY_END_TIME") {
            builder = builder.end_time(parse_int("GRANARY_END_TIME", &v)? as u64);
        }

        builder.build()
    }

    /// Validate configuration (fail-closed).
    pub fn validate(&self) -> Result<()> {
        if self.owner.is_zero() {
            return Err(GranaryError::ConfigError("owner must not be zero".into()));
        }
        if self.factory_address.is_zero() {
            return Err(GranaryError::ConfigError(
                "factory_address must not be zero".into(),
            ));
        }
        if self.reward_token.is_zero() || self.escrow_token.is_zero() {
            return Err(GranaryError::ConfigError(
                "reward and escrow tokens must be set".into(),
            ));
        }
        if self.reward_token == self.escrow_token {
            return Err(GranaryError::ConfigError(
                "reward and escrow tokens must differ".into(),
            ));
        }
        if self.seconds_per_update == 0 {
            return Err(GranaryError::ConfigError(
                "seconds_per_update must be > 0".into(),
            ));
        }
        if self.end_time == 0 {
            return Err(GranaryError::ConfigError("end_time must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_hex32(var: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)
        .map_err(|e| GranaryError::ConfigError(format!("{var} is not valid hex: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| GranaryError::ConfigError(format!("{var} must be 32 bytes (64 hex chars)")))?;
    Ok(arr)
}

fn parse_int(var: &str, value: &str) -> Result<u128> {
    value
        .parse::<u128>()
        .map_err(|e| GranaryError::ConfigError(format!("invalid {var}: {e}")))
}

/// Builder for [`EngineConfig`].
#[derive(Clone, Copy, Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        EngineConfigBuilder {
            config: EngineConfig {
                owner: Address::ZERO,
                factory_address: Address::ZERO,
                reward_token: TokenId::ZERO,
                escrow_token: TokenId::ZERO,
                reward_per_second: 0,
                seconds_per_update: 14 * 24 * 60 * 60,
                end_time: 0,
            },
        }
    }
}

impl EngineConfigBuilder {
    pub fn owner(mut self, owner: Address) -> Self {
        self.config.owner = owner;
        self
    }

    pub fn factory_address(mut self, address: Address) -> Self {
        self.config.factory_address = address;
        self
    }

    pub fn reward_token(mut self, token: TokenId) -> Self {
        self.config.reward_token = token;
        self
    }

    pub fn escrow_token(mut self, token: TokenId) -> Self {
        self.config.escrow_token = token;
        self
    }

    pub fn reward_per_second(mut self, rate: u128) -> Self {
        self.config.reward_per_second = rate;
        self
    }

    pub fn seconds_per_update(mut self, seconds: u64) -> Self {
        self.config.seconds_per_update = seconds;
        self
    }

    pub fn end_time(mut self, end_time: Timestamp) -> Self {
        self.config.end_time = end_time;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
