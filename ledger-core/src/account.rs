//! Ledger account state and its checked mutations
//!
//! [`LedgerAccount`] is the cached balance row for one (owner, asset) pair.
//! Every mutation validates first and mutates second, so a rejected call
//! leaves the account untouched. Callers (see [`crate::Ledger`]) hold the
//! account's lock for the whole read-modify-append sequence.

use crate::{
    types::{AccountBalances, AccountKey, EntryKind, ReleaseMode},
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance row for one (owner, asset) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    /// Account identity
    pub key: AccountKey,

    /// Total funds, frozen included
    pub balance: Decimal,

    /// Funds reserved by in-flight operations
    pub frozen_balance: Decimal,

    /// Number of entries written for this account
    pub sequence: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// A validated balance change, ready to be journaled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Movement {
    /// Entry kind to record
    pub kind: EntryKind,
    /// Signed amount of the movement
    pub amount: Decimal,
    /// Change to `balance`
    pub balance_delta: Decimal,
    /// Change to `frozen_balance`
    pub frozen_delta: Decimal,
}

impl LedgerAccount {
    /// Create an empty account
    pub fn new(key: AccountKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            balance: Decimal::ZERO,
            frozen_balance: Decimal::ZERO,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// `balance - frozen_balance`
    pub fn available_balance(&self) -> Decimal {
        self.balance - self.frozen_balance
    }

    /// Balance snapshot
    pub fn balances(&self) -> AccountBalances {
        AccountBalances {
            balance: self.balance,
            frozen_balance: self.frozen_balance,
            available_balance: self.available_balance(),
        }
    }

    /// Freeze `amount` of the available balance
    pub fn reserve(&mut self, amount: Decimal) -> Result<Movement> {
        ensure_positive(amount)?;
        let available = self.available_balance();
        if amount > available {
            return Err(Error::InsufficientFunds {
                account: self.key.to_string(),
                requested: amount,
                available,
            });
        }

        self.apply(Movement {
            kind: EntryKind::Lock,
            amount,
            balance_delta: Decimal::ZERO,
            frozen_delta: amount,
        })
    }

    /// Unfreeze `amount`; `Consume` also removes it from the balance
    pub fn release(&mut self, amount: Decimal, mode: ReleaseMode) -> Result<Movement> {
        ensure_positive(amount)?;
        if amount > self.frozen_balance {
            return Err(Error::InvalidRelease(format!(
                "release of {} exceeds frozen {} on {}",
                amount, self.frozen_balance, self.key
            )));
        }

        let balance_delta = match mode {
            ReleaseMode::Return => Decimal::ZERO,
            ReleaseMode::Consume => -amount,
        };

        self.apply(Movement {
            kind: EntryKind::Unlock,
            amount: -amount,
            balance_delta,
            frozen_delta: -amount,
        })
    }

    /// Spend previously frozen funds
    pub fn settle(&mut self, amount: Decimal) -> Result<Movement> {
        ensure_positive(amount)?;
        if amount > self.frozen_balance {
            return Err(Error::InvalidSettle(format!(
                "settle of {} exceeds frozen {} on {}",
                amount, self.frozen_balance, self.key
            )));
        }

        self.apply(Movement {
            kind: EntryKind::Post,
            amount: -amount,
            balance_delta: -amount,
            frozen_delta: -amount,
        })
    }

    /// Add funds to the balance
    pub fn credit(&mut self, amount: Decimal) -> Result<Movement> {
        ensure_positive(amount)?;

        self.apply(Movement {
            kind: EntryKind::Post,
            amount,
            balance_delta: amount,
            frozen_delta: Decimal::ZERO,
        })
    }

    /// Negate an earlier post of `original` (signed)
    ///
    /// Reversing a credit removes funds and therefore needs them available.
    pub fn reverse(&mut self, original: Decimal) -> Result<Movement> {
        if original.is_zero() {
            return Err(Error::InvalidAmount("cannot reverse a zero post".to_string()));
        }
        let delta = -original;
        if delta.is_sign_negative() && -delta > self.available_balance() {
            return Err(Error::InsufficientFunds {
                account: self.key.to_string(),
                requested: -delta,
                available: self.available_balance(),
            });
        }

        self.apply(Movement {
            kind: EntryKind::Reversal,
            amount: delta,
            balance_delta: delta,
            frozen_delta: Decimal::ZERO,
        })
    }

    /// Apply a movement, enforcing `0 <= frozen <= balance`
    ///
    /// Used directly by journal replay; the checked methods above call it after
    /// their own validation.
    pub fn apply(&mut self, movement: Movement) -> Result<Movement> {
        let balance = self.balance + movement.balance_delta;
        let frozen = self.frozen_balance + movement.frozen_delta;

        if frozen.is_sign_negative() || balance.is_sign_negative() || frozen > balance {
            return Err(Error::InvariantViolation(format!(
                "{} would reach balance={} frozen={}",
                self.key, balance, frozen
            )));
        }

        self.balance = balance;
        self.frozen_balance = frozen;
        self.sequence += 1;
        self.updated_at = Utc::now();
        Ok(movement)
    }
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}
