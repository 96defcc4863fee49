//! Reference in-memory token backend.
//!
//! Hosts embedding the engine against a real token layer implement
//! [`Tokens`](crate::Tokens) themselves; this ledger backs tests, simulations
//! and single-process deployments. A per-token transfer fee can be configured
//! to model deflationary tokens, which is what the engine's measured-deposit
//! rule exists for.

use std::collections::BTreeMap;

use crate::{Address, GranaryError, Result, TokenId, Tokens};

const FEE_DENOMINATOR: u128 = 10_000;

#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    balances: BTreeMap<(TokenId, Address), u128>,
    supplies: BTreeMap<TokenId, u128>,
    /// Basis-point fee burned from the transferred amount before crediting
    /// the recipient.
    transfer_fee_bps: BTreeMap<TokenId, u128>,
}

impl InMemoryLedger {
    pub fn new() -> InMemoryLedger {
        InMemoryLedger::default()
    }

    /// Configure a fee-on-transfer token. `bps` must be below 10_000.
    pub fn set_transfer_fee(&mut self, token: TokenId, bps: u128) {
        self.transfer_fee_bps.insert(token, bps.min(FEE_DENOMINATOR));
    }
}

impl Tokens for InMemoryLedger {
    fn balance_of(&self, token: TokenId, owner: Address) -> u128 {
        self.balances.get(&(token, owner)).copied().unwrap_or(0)
    }

    fn total_supply(&self, token: TokenId) -> u128 {
        self.supplies.get(&token).copied().unwrap_or(0)
    }

    fn transfer(&mut self, token: TokenId, from: Address, to: Address, value: u128) -> Result<()> {
        let from_balance = self.balance_of(token, from);
        if from_balance < value {
            return Err(GranaryError::TokenFailure(format!(
                "insufficient balance: {from_balance} < {value}"
            )));
        }
        let fee_bps = self.transfer_fee_bps.get(&token).copied().unwrap_or(0);
        let fee = value
            .checked_mul(fee_bps)
            .ok_or(GranaryError::Overflow("transfer_fee"))?
            / FEE_DENOMINATOR;
        let delivered = value - fee;

        self.balances.insert((token, from), from_balance - value);
        let to_balance = self.balance_of(token, to);
        self.balances.insert(
            (token, to),
            to_balance
                .checked_add(delivered)
                .ok_or(GranaryError::Overflow("transfer_credit"))?,
        );
        if fee > 0 {
            let supply = self.total_supply(token);
            self.supplies.insert(token, supply.saturating_sub(fee));
        }
        Ok(())
    }

    fn mint(&mut self, token: TokenId, to: Address, value: u128) -> Result<()> {
        let balance = self.balance_of(token, to);
        self.balances.insert(
            (token, to),
            balance
                .checked_add(value)
                .ok_or(GranaryError::Overflow("mint_credit"))?,
        );
        let supply = self.total_supply(token);
        self.supplies.insert(
            token,
            supply
                .checked_add(value)
                .ok_or(GranaryError::Overflow("mint_supply"))?,
        );
        Ok(())
    }
}
