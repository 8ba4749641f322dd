//! Main ledger layer
//!
//! Ties accounts, locking and storage together into the posting API used by
//! the transfer engine.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{AccountKey, Config, Ledger};
//! use rust_decimal::Decimal;
//! use uuid::Uuid;
//!
//! fn main() -> ledger_core::Result<()> {
//!     let ledger = Ledger::open(&Config::default())?;
//!     let account = AccountKey::new("alice", "BTC");
//!     let operation = Uuid::now_v7();
//!
//!     ledger.credit(&account, Decimal::new(100, 0), operation)?;
//!     ledger.reserve(&account, Decimal::new(40, 0), operation)?;
//!     ledger.settle(&account, Decimal::new(40, 0), operation)?;
//!     Ok(())
//! }
//! ```

use crate::{
    account::{LedgerAccount, Movement},
    locks::KeyedLocks,
    metrics::Metrics,
    types::{
        AccountBalances, AccountKey, AssetCode, EntryKind, EntryStatus, LedgerEntry, OwnerId,
        ReleaseMode,
    },
    Config, Error, Result, Storage, WriteSet,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Balance primitive applied by a [`Posting`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingAction {
    /// Freeze available funds
    Reserve,
    /// Unfreeze funds reserved by the same operation
    Release(ReleaseMode),
    /// Spend funds reserved by the same operation
    Settle,
    /// Add funds
    Credit,
    /// Negate a completed `post` entry
    Reverse {
        /// Entry being reversed
        entry_id: Uuid,
    },
}

/// One balance change requested against one account
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    /// Target account
    pub account: AccountKey,
    /// Primitive to apply
    pub action: PostingAction,
    /// Positive amount (ignored for reversals)
    pub amount: Decimal,
    /// Operation the resulting entry belongs to
    pub operation_id: Uuid,
}

impl Posting {
    /// Reserve `amount` for `operation_id`
    pub fn reserve(account: AccountKey, amount: Decimal, operation_id: Uuid) -> Self {
        Self {
            account,
            action: PostingAction::Reserve,
            amount,
            operation_id,
        }
    }

    /// Release `amount` previously reserved by `operation_id`
    pub fn release(
        account: AccountKey,
        amount: Decimal,
        mode: ReleaseMode,
        operation_id: Uuid,
    ) -> Self {
        Self {
            account,
            action: PostingAction::Release(mode),
            amount,
            operation_id,
        }
    }

    /// Settle `amount` previously reserved by `operation_id`
    pub fn settle(account: AccountKey, amount: Decimal, operation_id: Uuid) -> Self {
        Self {
            account,
            action: PostingAction::Settle,
            amount,
            operation_id,
        }
    }

    /// Credit `amount`
    pub fn credit(account: AccountKey, amount: Decimal, operation_id: Uuid) -> Self {
        Self {
            account,
            action: PostingAction::Credit,
            amount,
            operation_id,
        }
    }

    /// Reverse entry `entry_id` on `account`
    pub fn reverse(account: AccountKey, entry_id: Uuid, operation_id: Uuid) -> Self {
        Self {
            account,
            action: PostingAction::Reverse { entry_id },
            amount: Decimal::ZERO,
            operation_id,
        }
    }

    fn validate(&self) -> Result<()> {
        self.account.validate()?;
        if !matches!(self.action, PostingAction::Reverse { .. }) && self.amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }
}

/// Working copy of the journal slices a batch touches
///
/// Nothing here reaches storage unless the whole batch validates.
#[derive(Default)]
struct BatchState {
    accounts: BTreeMap<AccountKey, LedgerAccount>,
    operations: HashMap<Uuid, Vec<LedgerEntry>>,
    reversed: HashSet<Uuid>,
    dirty: HashSet<Uuid>,
    created: Vec<Uuid>,
}

/// Account ledger
pub struct Ledger {
    storage: Arc<Storage>,
    locks: KeyedLocks<AccountKey>,
    metrics: Metrics,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("storage", &self.storage)
            .field("locks", &self.locks)
            .finish()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub fn open(config: &Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(config)?);
        Self::with_storage(storage)
    }

    /// Build a ledger over an already opened storage
    pub fn with_storage(storage: Arc<Storage>) -> Result<Self> {
        let metrics = Metrics::new().map_err(|e| Error::Other(format!("metrics: {}", e)))?;
        Ok(Self {
            storage,
            locks: KeyedLocks::new(),
            metrics,
        })
    }

    /// Underlying storage (reads and caller-owned records)
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Ledger metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Single postings

    /// Freeze `amount` on `account` for `operation_id`
    pub fn reserve(
        &self,
        account: &AccountKey,
        amount: Decimal,
        operation_id: Uuid,
    ) -> Result<LedgerEntry> {
        self.post_one(Posting::reserve(account.clone(), amount, operation_id))
    }

    /// Unfreeze `amount` reserved by `operation_id`
    pub fn release(
        &self,
        account: &AccountKey,
        amount: Decimal,
        mode: ReleaseMode,
        operation_id: Uuid,
    ) -> Result<LedgerEntry> {
        self.post_one(Posting::release(account.clone(), amount, mode, operation_id))
    }

    /// Spend `amount` reserved by `operation_id`
    pub fn settle(
        &self,
        account: &AccountKey,
        amount: Decimal,
        operation_id: Uuid,
    ) -> Result<LedgerEntry> {
        self.post_one(Posting::settle(account.clone(), amount, operation_id))
    }

    /// Add `amount` to `account`
    pub fn credit(
        &self,
        account: &AccountKey,
        amount: Decimal,
        operation_id: Uuid,
    ) -> Result<LedgerEntry> {
        self.post_one(Posting::credit(account.clone(), amount, operation_id))
    }

    /// Append a reversal of the completed post `entry_id`
    pub fn reverse(&self, entry_id: Uuid, operation_id: Uuid) -> Result<LedgerEntry> {
        let original = self.storage.get_entry(entry_id)?;
        self.post_one(Posting::reverse(original.account, entry_id, operation_id))
    }

    fn post_one(&self, posting: Posting) -> Result<LedgerEntry> {
        self.post_batch(vec![posting], WriteSet::new())?
            .pop()
            .ok_or_else(|| Error::Other("posting produced no entry".to_string()))
    }

    /// Apply postings and `attached` records as one atomic unit
    ///
    /// Locks every touched account in key order, validates all postings
    /// against a working copy and writes a single batch. Any rejection leaves
    /// storage untouched. Returns the new entries in posting order.
    pub fn post_batch(
        &self,
        postings: Vec<Posting>,
        attached: WriteSet,
    ) -> Result<Vec<LedgerEntry>> {
        if postings.is_empty() {
            self.storage.commit(attached)?;
            return Ok(Vec::new());
        }

        let started = Instant::now();
        for posting in &postings {
            posting.validate()?;
        }

        let _guards = self.locks.lock_many(postings.iter().map(|p| &p.account));

        let mut state = BatchState::default();
        for posting in &postings {
            if let Err(err) = self.apply_posting(&mut state, posting) {
                if matches!(err, Error::InsufficientFunds { .. }) {
                    self.metrics.record_insufficient_funds();
                }
                tracing::debug!(
                    account = %posting.account,
                    operation_id = %posting.operation_id,
                    action = ?posting.action,
                    error = %err,
                    "Posting rejected"
                );
                return Err(err);
            }
        }

        let created = self.write_state(state, attached)?;
        self.metrics.record_batch(postings.len(), started.elapsed().as_secs_f64());
        for entry in &created {
            self.metrics.record_entry(entry.kind);
            tracing::info!(
                account = %entry.account,
                operation_id = %entry.operation_id,
                kind = %entry.kind,
                amount = %entry.amount,
                balance = %entry.balance_after,
                frozen = %entry.frozen_after,
                "Ledger entry posted"
            );
        }
        Ok(created)
    }

    /// Write caller-owned records without touching balances
    pub fn commit_records(&self, records: WriteSet) -> Result<()> {
        self.storage.commit(records)
    }

    /// Flag the still-reserved lock entries of an operation as `error`
    ///
    /// Used when an operation is parked for manual intervention. The flag is
    /// cleared by the eventual release or settle. Returns the number of entries
    /// flagged.
    pub fn mark_entries_error(&self, operation_id: Uuid, attached: WriteSet) -> Result<usize> {
        let entries = self.storage.operation_entries(operation_id)?;
        let accounts: Vec<AccountKey> = entries.iter().map(|e| e.account.clone()).collect();
        let _guards = self.locks.lock_many(accounts.iter());

        // Re-read under the locks
        let entries = self.storage.operation_entries(operation_id)?;
        let mut set = WriteSet::new();
        let mut flagged = 0;
        for mut entry in entries {
            if entry.kind == EntryKind::Lock && entry.status == EntryStatus::Pending {
                entry.status = EntryStatus::Error;
                set.put_entry(entry);
                flagged += 1;
            }
        }
        set.extend(attached);
        self.storage.commit(set)?;

        tracing::warn!(%operation_id, flagged, "Lock entries flagged for manual intervention");
        Ok(flagged)
    }

    // Reads

    /// Balances of one account; zero if it was never touched
    pub fn balances(&self, account: &AccountKey) -> Result<AccountBalances> {
        Ok(self
            .storage
            .get_account(account)?
            .map(|a| a.balances())
            .unwrap_or(AccountBalances::ZERO))
    }

    /// Balances of every account an owner holds
    pub fn balances_for_owner(&self, owner: &OwnerId) -> Result<Vec<(AssetCode, AccountBalances)>> {
        Ok(self
            .storage
            .accounts_for_owner(owner)?
            .into_iter()
            .map(|a| (a.key.asset.clone(), a.balances()))
            .collect())
    }

    /// Journal of one account in sequence order
    pub fn entries(&self, account: &AccountKey) -> Result<Vec<LedgerEntry>> {
        self.storage.account_entries(account)
    }

    /// Entries owned by one operation
    pub fn operation_entries(&self, operation_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.storage.operation_entries(operation_id)
    }

    /// Funds still frozen by an operation, per account (non-zero only)
    pub fn outstanding_reservations(
        &self,
        operation_id: Uuid,
    ) -> Result<BTreeMap<AccountKey, Decimal>> {
        let mut outstanding: BTreeMap<AccountKey, Decimal> = BTreeMap::new();
        for entry in self.storage.operation_entries(operation_id)? {
            *outstanding.entry(entry.account).or_default() += entry.frozen_delta;
        }
        outstanding.retain(|_, amount| !amount.is_zero());
        Ok(outstanding)
    }

    // Audit

    /// Recompute an account's balances from its journal
    ///
    /// Fails with `InvariantViolation` if a sequence number is skipped, a
    /// snapshot disagrees with the running totals, or an intermediate state
    /// breaks `0 <= frozen <= balance`.
    pub fn replay(&self, account: &AccountKey) -> Result<AccountBalances> {
        let mut replayed = LedgerAccount::new(account.clone());
        for entry in self.storage.account_entries(account)? {
            if entry.sequence != replayed.sequence + 1 {
                return Err(Error::InvariantViolation(format!(
                    "{}: expected sequence {}, found {}",
                    account,
                    replayed.sequence + 1,
                    entry.sequence
                )));
            }
            replayed.apply(Movement {
                kind: entry.kind,
                amount: entry.amount,
                balance_delta: entry.balance_delta,
                frozen_delta: entry.frozen_delta,
            })?;
            if replayed.balance != entry.balance_after
                || replayed.frozen_balance != entry.frozen_after
            {
                return Err(Error::InvariantViolation(format!(
                    "{}: snapshot mismatch at sequence {}",
                    account, entry.sequence
                )));
            }
        }
        Ok(replayed.balances())
    }

    /// Check that replaying the journal reproduces the cached account row
    pub fn verify_account(&self, account: &AccountKey) -> Result<AccountBalances> {
        let replayed = self.replay(account)?;
        let cached = self.balances(account)?;
        if replayed != cached {
            return Err(Error::InvariantViolation(format!(
                "{}: cached {:?} differs from journal {:?}",
                account, cached, replayed
            )));
        }
        Ok(cached)
    }

    // Batch internals

    fn apply_posting(&self, state: &mut BatchState, posting: &Posting) -> Result<()> {
        let op = posting.operation_id;
        self.load_operation(state, op)?;
        if !state.accounts.contains_key(&posting.account) {
            let account = self
                .storage
                .get_account(&posting.account)?
                .unwrap_or_else(|| LedgerAccount::new(posting.account.clone()));
            state.accounts.insert(posting.account.clone(), account);
        }

        let outstanding = Self::outstanding_on(&state.operations[&op], &posting.account);
        let mut reverses = None;

        let account = state
            .accounts
            .get_mut(&posting.account)
            .ok_or_else(|| Error::Other("account missing from batch".to_string()))?;

        let movement = match posting.action {
            PostingAction::Reserve => account.reserve(posting.amount)?,
            PostingAction::Credit => account.credit(posting.amount)?,
            PostingAction::Release(mode) => {
                if posting.amount > outstanding {
                    return Err(Error::InvalidRelease(format!(
                        "operation {} holds {} on {}, cannot release {}",
                        op, outstanding, posting.account, posting.amount
                    )));
                }
                account.release(posting.amount, mode)?
            }
            PostingAction::Settle => {
                if posting.amount > outstanding {
                    return Err(Error::InvalidSettle(format!(
                        "operation {} holds {} on {}, cannot settle {}",
                        op, outstanding, posting.account, posting.amount
                    )));
                }
                account.settle(posting.amount)?
            }
            PostingAction::Reverse { entry_id } => {
                let original = self.storage.get_entry(entry_id)?;
                if original.account != posting.account
                    || original.kind != EntryKind::Post
                    || original.status != EntryStatus::Completed
                {
                    return Err(Error::InvalidAmount(format!(
                        "entry {} is not a completed post on {}",
                        entry_id, posting.account
                    )));
                }
                if state.reversed.contains(&entry_id)
                    || self.is_reversed(&posting.account, entry_id)?
                {
                    return Err(Error::InvalidAmount(format!(
                        "entry {} already reversed",
                        entry_id
                    )));
                }
                state.reversed.insert(entry_id);
                reverses = Some(entry_id);
                account.reverse(original.amount)?
            }
        };

        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            account: posting.account.clone(),
            sequence: account.sequence,
            kind: movement.kind,
            amount: movement.amount,
            balance_delta: movement.balance_delta,
            frozen_delta: movement.frozen_delta,
            balance_after: account.balance,
            frozen_after: account.frozen_balance,
            operation_id: op,
            reverses,
            status: match movement.kind {
                EntryKind::Lock => EntryStatus::Pending,
                _ => EntryStatus::Completed,
            },
            created_at: Utc::now(),
        };

        state.created.push(entry.entry_id);
        let entries = state
            .operations
            .get_mut(&op)
            .ok_or_else(|| Error::Other("operation missing from batch".to_string()))?;
        entries.push(entry);

        // Reservation fully consumed: resolve its lock entries
        if matches!(posting.action, PostingAction::Release(_) | PostingAction::Settle)
            && Self::outstanding_on(entries, &posting.account).is_zero()
        {
            let resolved = match posting.action {
                PostingAction::Release(ReleaseMode::Return) => EntryStatus::Failed,
                _ => EntryStatus::Completed,
            };
            for lock in entries.iter_mut().filter(|e| {
                e.account == posting.account
                    && e.kind == EntryKind::Lock
                    && !e.status.is_terminal()
            }) {
                lock.status = resolved;
                state.dirty.insert(lock.entry_id);
            }
        }

        Ok(())
    }

    fn load_operation(&self, state: &mut BatchState, operation_id: Uuid) -> Result<()> {
        if !state.operations.contains_key(&operation_id) {
            let entries = self.storage.operation_entries(operation_id)?;
            state.operations.insert(operation_id, entries);
        }
        Ok(())
    }

    fn outstanding_on(entries: &[LedgerEntry], account: &AccountKey) -> Decimal {
        entries
            .iter()
            .filter(|e| &e.account == account)
            .map(|e| e.frozen_delta)
            .sum()
    }

    fn is_reversed(&self, account: &AccountKey, entry_id: Uuid) -> Result<bool> {
        Ok(self
            .storage
            .account_entries(account)?
            .iter()
            .any(|e| e.reverses == Some(entry_id)))
    }

    fn write_state(&self, state: BatchState, attached: WriteSet) -> Result<Vec<LedgerEntry>> {
        let BatchState {
            accounts,
            operations,
            dirty,
            created,
            ..
        } = state;

        let mut by_id: HashMap<Uuid, LedgerEntry> = operations
            .into_values()
            .flatten()
            .filter(|e| dirty.contains(&e.entry_id) || created.contains(&e.entry_id))
            .map(|e| (e.entry_id, e))
            .collect();

        let mut set = WriteSet::new();
        for account in accounts.into_values() {
            set.put_account(account);
        }

        let mut new_entries = Vec::with_capacity(created.len());
        for id in &created {
            if let Some(entry) = by_id.remove(id) {
                set.put_entry(entry.clone());
                new_entries.push(entry);
            }
        }
        for (_, entry) in by_id {
            set.put_entry(entry);
        }
        set.extend(attached);

        self.storage.commit(set)?;
        Ok(new_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn create_test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (Ledger::open(&config).unwrap(), temp_dir)
    }

    fn funded(ledger: &Ledger, account: &AccountKey, amount: Decimal) {
        ledger.credit(account, amount, Uuid::now_v7()).unwrap();
    }

    #[test]
    fn test_reserve_then_settle() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "BTC");
        funded(&ledger, &alice, dec!(100));
        let op = Uuid::now_v7();

        let lock = ledger.reserve(&alice, dec!(40), op).unwrap();
        assert_eq!(lock.status, EntryStatus::Pending);
        assert_eq!(lock.frozen_after, dec!(40));
        assert_eq!(ledger.balances(&alice).unwrap().available_balance, dec!(60));

        let post = ledger.settle(&alice, dec!(40), op).unwrap();
        assert_eq!(post.kind, EntryKind::Post);
        assert_eq!(post.balance_after, dec!(60));
        assert_eq!(post.frozen_after, dec!(0));

        // Lock entry resolved together with the settle
        let lock = ledger.storage().get_entry(lock.entry_id).unwrap();
        assert_eq!(lock.status, EntryStatus::Completed);
        assert!(ledger.outstanding_reservations(op).unwrap().is_empty());
    }

    #[test]
    fn test_second_reserve_insufficient() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "BTC");
        funded(&ledger, &alice, dec!(100));

        ledger.reserve(&alice, dec!(40), Uuid::now_v7()).unwrap();
        let before = ledger.balances(&alice).unwrap();
        let entries_before = ledger.entries(&alice).unwrap().len();

        let result = ledger.reserve(&alice, dec!(70), Uuid::now_v7());
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
        assert_eq!(ledger.balances(&alice).unwrap(), before);
        assert_eq!(ledger.entries(&alice).unwrap().len(), entries_before);
        assert_eq!(ledger.metrics().insufficient_funds_total.get(), 1);
    }

    #[test]
    fn test_release_bounded_by_operation() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "BTC");
        funded(&ledger, &alice, dec!(100));
        let op_a = Uuid::now_v7();
        let op_b = Uuid::now_v7();

        ledger.reserve(&alice, dec!(30), op_a).unwrap();
        ledger.reserve(&alice, dec!(20), op_b).unwrap();

        // op_b cannot release op_a's funds
        let result = ledger.release(&alice, dec!(30), ReleaseMode::Return, op_b);
        assert!(matches!(result, Err(Error::InvalidRelease(_))));
        let result = ledger.settle(&alice, dec!(21), op_b);
        assert!(matches!(result, Err(Error::InvalidSettle(_))));

        let lock = ledger.operation_entries(op_a).unwrap().remove(0);
        ledger.release(&alice, dec!(30), ReleaseMode::Return, op_a).unwrap();
        let balances = ledger.balances(&alice).unwrap();
        assert_eq!(balances.balance, dec!(100));
        assert_eq!(balances.frozen_balance, dec!(20));
        assert_eq!(
            ledger.storage().get_entry(lock.entry_id).unwrap().status,
            EntryStatus::Failed
        );
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "BTC");
        let bob = AccountKey::new("bob", "BTC");
        funded(&ledger, &alice, dec!(10));
        let op = Uuid::now_v7();

        let mut records = WriteSet::new();
        records.put_operation(op, b"row".to_vec());
        let result = ledger.post_batch(
            vec![
                Posting::credit(bob.clone(), dec!(5), op),
                Posting::reserve(alice.clone(), dec!(11), op),
            ],
            records,
        );

        assert!(result.is_err());
        assert_eq!(ledger.balances(&bob).unwrap(), AccountBalances::ZERO);
        assert!(ledger.storage().get_operation(op).unwrap().is_none());
    }

    #[test]
    fn test_batch_reserve_settle_credit() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "USDT");
        let bob = AccountKey::new("bob", "USDT");
        funded(&ledger, &alice, dec!(50));
        let op = Uuid::now_v7();

        let entries = ledger
            .post_batch(
                vec![
                    Posting::reserve(alice.clone(), dec!(20), op),
                    Posting::settle(alice.clone(), dec!(20), op),
                    Posting::credit(bob.clone(), dec!(20), op),
                ],
                WriteSet::new(),
            )
            .unwrap();

        assert_eq!(entries.len(), 3);
        // The lock written in this batch is already resolved
        assert_eq!(entries[0].status, EntryStatus::Completed);
        assert_eq!(ledger.balances(&alice).unwrap().balance, dec!(30));
        assert_eq!(ledger.balances(&bob).unwrap().balance, dec!(20));
    }

    #[test]
    fn test_reverse_credit_once() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "BTC");
        let credit = ledger.credit(&alice, dec!(25), Uuid::now_v7()).unwrap();

        let correction = Uuid::now_v7();
        let reversal = ledger.reverse(credit.entry_id, correction).unwrap();
        assert_eq!(reversal.kind, EntryKind::Reversal);
        assert_eq!(reversal.reverses, Some(credit.entry_id));
        assert_eq!(ledger.balances(&alice).unwrap().balance, dec!(0));

        assert!(ledger.reverse(credit.entry_id, correction).is_err());
    }

    #[test]
    fn test_reverse_rejects_lock_entry() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "BTC");
        funded(&ledger, &alice, dec!(10));
        let lock = ledger.reserve(&alice, dec!(5), Uuid::now_v7()).unwrap();

        assert!(ledger.reverse(lock.entry_id, Uuid::now_v7()).is_err());
    }

    #[test]
    fn test_replay_matches_cached_row() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "BTC");
        funded(&ledger, &alice, dec!(100));
        let op = Uuid::now_v7();
        ledger.reserve(&alice, dec!(40), op).unwrap();
        ledger.release(&alice, dec!(15), ReleaseMode::Return, op).unwrap();
        ledger.settle(&alice, dec!(25), op).unwrap();

        let verified = ledger.verify_account(&alice).unwrap();
        assert_eq!(verified.balance, dec!(75));
        assert_eq!(verified.frozen_balance, dec!(0));
    }

    #[test]
    fn test_mark_entries_error_then_resolve() {
        let (ledger, _temp) = create_test_ledger();
        let alice = AccountKey::new("alice", "BTC");
        funded(&ledger, &alice, dec!(10));
        let op = Uuid::now_v7();
        let lock = ledger.reserve(&alice, dec!(10), op).unwrap();

        assert_eq!(ledger.mark_entries_error(op, WriteSet::new()).unwrap(), 1);
        assert_eq!(
            ledger.storage().get_entry(lock.entry_id).unwrap().status,
            EntryStatus::Error
        );

        ledger.settle(&alice, dec!(10), op).unwrap();
        assert_eq!(
            ledger.storage().get_entry(lock.entry_id).unwrap().status,
            EntryStatus::Completed
        );
    }

    #[test]
    fn test_balances_for_owner() {
        let (ledger, _temp) = create_test_ledger();
        funded(&ledger, &AccountKey::new("alice", "BTC"), dec!(1));
        funded(&ledger, &AccountKey::new("alice", "ETH"), dec!(2));
        funded(&ledger, &AccountKey::new("bob", "BTC"), dec!(3));

        let balances = ledger.balances_for_owner(&OwnerId::new("alice")).unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].0, AssetCode::new("BTC"));
        assert_eq!(balances[1].1.balance, dec!(2));
    }

    #[test]
    fn test_invalid_inputs() {
        let (ledger, _temp) = create_test_ledger();
        let op = Uuid::now_v7();
        assert!(matches!(
            ledger.credit(&AccountKey::new("alice", "BTC"), dec!(0), op),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.credit(&AccountKey::new("", "BTC"), dec!(1), op),
            Err(Error::InvalidAccount(_))
        ));
    }
}
