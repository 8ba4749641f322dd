//! DelTran Ledger Core
//!
//! Account balances and the append-only journal that backs them.
//!
//! # Architecture
//!
//! - **Journal first**: every balance change is a [`LedgerEntry`]; the account
//!   row is a cache that replaying the journal must reproduce exactly
//! - **Per-account locking**: mutations on one account serialize, mutations on
//!   different accounts never contend
//! - **Atomic batches**: a balance change, its entry and any attached records
//!   (operation rows, outbox events) land in one RocksDB write batch
//!
//! # Invariants
//!
//! - `0 <= frozen_balance <= balance` for every account at all times
//! - Replaying an account's entries in sequence order reproduces its balances
//! - Entries are never deleted; only their status field changes
//! - Release/settle never exceed what the owning operation reserved

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod account;
pub mod config;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports
pub use account::{LedgerAccount, Movement};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{Ledger, Posting, PostingAction};
pub use locks::{KeyGuard, KeyedLocks};
pub use storage::{Storage, WriteSet};
pub use types::{
    AccountBalances, AccountKey, AssetCode, EntryKind, EntryStatus, LedgerEntry, OwnerId,
    ReleaseMode,
};
