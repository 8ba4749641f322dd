//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Owner identifier (user, merchant, platform treasury)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create new owner ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asset code (`BTC`, `USDT`, `USD`); always stored upper-case
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetCode(String);

impl AssetCode {
    /// Create new asset code, normalizing to upper-case
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one ledger account: an (owner, asset) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    /// Account owner
    pub owner: OwnerId,
    /// Asset held in the account
    pub asset: AssetCode,
}

impl AccountKey {
    /// Create new account key
    pub fn new(owner: impl Into<String>, asset: impl AsRef<str>) -> Self {
        Self {
            owner: OwnerId::new(owner),
            asset: AssetCode::new(asset),
        }
    }

    /// Reject keys that cannot be encoded unambiguously
    pub fn validate(&self) -> crate::Result<()> {
        let owner = self.owner.as_str();
        let asset = self.asset.as_str();
        if owner.is_empty() || asset.is_empty() {
            return Err(crate::Error::InvalidAccount(format!(
                "empty owner or asset in {}",
                self
            )));
        }
        if owner.len() > u16::MAX as usize
            || owner.chars().any(char::is_control)
            || asset.chars().any(char::is_control)
        {
            return Err(crate::Error::InvalidAccount(format!(
                "unencodable account key {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Storage key: `owner_len (u16 BE) || owner || asset`
    ///
    /// The length prefix makes `owner_prefix(owner)` a strict prefix of every
    /// account that owner holds.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = Self::owner_prefix(&self.owner);
        key.extend_from_slice(self.asset.as_str().as_bytes());
        key
    }

    /// Prefix shared by all account keys of one owner
    pub fn owner_prefix(owner: &OwnerId) -> Vec<u8> {
        let owner = owner.as_str().as_bytes();
        let mut key = Vec::with_capacity(2 + owner.len() + 8);
        key.extend_from_slice(&(owner.len() as u16).to_be_bytes());
        key.extend_from_slice(owner);
        key
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.asset)
    }
}

/// Kind of balance movement recorded by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Funds moved from available to frozen
    Lock = 1,
    /// Frozen funds released (returned to available or consumed)
    Unlock = 2,
    /// Balance posted: credit, or settlement of frozen funds
    Post = 3,
    /// Correction negating an earlier post
    Reversal = 4,
}

impl EntryKind {
    /// Lower-case name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Lock => "lock",
            EntryKind::Unlock => "unlock",
            EntryKind::Post => "post",
            EntryKind::Reversal => "reversal",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry status; the only entry field that may change after it is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryStatus {
    /// Reservation still outstanding
    Pending = 1,
    /// Movement final (reservation settled, or a non-lock entry)
    Completed = 2,
    /// Reservation released without being spent
    Failed = 3,
    /// Owning operation parked for manual intervention
    Error = 4,
}

impl EntryStatus {
    /// Whether the status can still change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending | EntryStatus::Error)
    }
}

/// What happens to released funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseMode {
    /// Funds go back to available; `balance` unchanged
    Return,
    /// Funds leave the account together with the freeze
    Consume,
}

/// Immutable journal record of one balance movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Account the movement applies to
    pub account: AccountKey,

    /// Position in the account's journal, starting at 1
    pub sequence: u64,

    /// Kind of movement
    pub kind: EntryKind,

    /// Signed amount of the movement (negative when funds leave)
    pub amount: Decimal,

    /// Change applied to `balance`
    pub balance_delta: Decimal,

    /// Change applied to `frozen_balance`
    pub frozen_delta: Decimal,

    /// `balance` immediately after this entry
    pub balance_after: Decimal,

    /// `frozen_balance` immediately after this entry
    pub frozen_after: Decimal,

    /// Operation that owns this entry
    pub operation_id: Uuid,

    /// Entry this one reverses, for `Reversal` entries
    pub reverses: Option<Uuid>,

    /// Entry status
    pub status: EntryStatus,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Balance view of one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalances {
    /// Total funds including frozen
    pub balance: Decimal,
    /// Funds reserved by in-flight operations
    pub frozen_balance: Decimal,
    /// `balance - frozen_balance`
    pub available_balance: Decimal,
}

impl AccountBalances {
    /// Balances of an account that does not exist yet
    pub const ZERO: Self = Self {
        balance: Decimal::ZERO,
        frozen_balance: Decimal::ZERO,
        available_balance: Decimal::ZERO,
    };
}
