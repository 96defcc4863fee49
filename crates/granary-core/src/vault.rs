//! Externally-funded reward path.
//!
//! A privileged vault pushes already-minted reward tokens into a pool; they
//! are distributed over the current global weight through a second
//! accumulator that mirrors the yield one. Users receive their share as a
//! direct transfer the next time their rewards are processed.

use crate::events::Event;
use crate::factory::PoolFactory;
use crate::math::{add_u128, reward_per_weight, sub_u128};
use crate::pool::Pool;
use crate::types::EmissionView;
use crate::{Address, Clock, GranaryError, Result, Timestamp, Tokens, TokenId};

impl Pool {
    /// Accept a vault deposit and fold it into `vault_rewards_per_weight`.
    ///
    /// Distribution happens at receive time, so an empty pool cannot accept
    /// vault rewards (there is no weight to attribute them to).
    pub(crate) fn receive_vault_rewards<T: Tokens>(
        &mut self,
        vault: Address,
        value: u128,
        now: Timestamp,
        view: &EmissionView,
        tokens: &mut T,
        events: &mut Vec<Event>,
    ) -> Result<u128> {
        if value == 0 {
            return Err(GranaryError::ZeroValue);
        }
        if self.global_weight == 0 {
            return Err(GranaryError::NoActiveWeight);
        }
        self.sync(now, view, events)?;

        // Measured like any deposit; the reward token itself may take a fee.
        let before = tokens.balance_of(self.reward_token, self.address);
        tokens.transfer(self.reward_token, vault, self.address, value)?;
        let after = tokens.balance_of(self.reward_token, self.address);
        let received = sub_u128(after, before, "vault_deposit")?;

        self.vault_rewards_per_weight = add_u128(
            self.vault_rewards_per_weight,
            reward_per_weight(received, self.global_weight)?,
            "vault_accumulator",
        )?;
        tracing::debug!(pool = %self.pool_token, received, "vault rewards received");
        events.push(Event::VaultRewardsReceived {
            pool: self.pool_token,
            value: received,
        });
        Ok(received)
    }
}

impl<C: Clock, T: Tokens> PoolFactory<C, T> {
    /// Install the vault authority. Owner-only.
    pub fn set_vault(&mut self, caller: Address, vault: Address) -> Result<()> {
        if caller != self.config.owner {
            return Err(GranaryError::AccessDenied);
        }
        if vault.is_zero() {
            return Err(GranaryError::ZeroAddress);
        }
        let previous = self.vault;
        self.vault = vault;
        tracing::info!(%previous, current = %vault, "vault updated");
        self.events.push(Event::VaultSet {
            previous,
            current: vault,
        });
        Ok(())
    }

    /// Vault-only: distribute `value` reward tokens over the pool's current
    /// weight. Returns the received (measured) amount.
    pub fn receive_vault_rewards(
        &mut self,
        caller: Address,
        pool_token: TokenId,
        value: u128,
    ) -> Result<u128> {
        if self.vault.is_zero() || caller != self.vault {
            return Err(GranaryError::NotVault);
        }
        self.mutate_pool(pool_token, &[], |pool, now, view, tokens, events| {
            pool.receive_vault_rewards(caller, value, now, view, tokens, events)
        })
    }
}
