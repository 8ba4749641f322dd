//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Cached balance rows (key: owner_len || owner || asset)
//! - `entries` - Append-only journal (key: entry_id)
//! - `indices` - Secondary indices (account journal order, entries per operation,
//!   plus namespaces owned by callers)
//! - `operations` - Opaque operation rows written by the orchestration layer
//! - `outbox` - Pending outbound events (key: event_id, UUIDv7 so byte order is
//!   creation order)
//!
//! Every mutation goes through [`Storage::commit`] with a [`WriteSet`], which
//! becomes a single RocksDB `WriteBatch`.

use crate::{
    account::LedgerAccount,
    error::{Error, Result},
    types::{AccountKey, LedgerEntry, OwnerId},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_INDICES: &str = "indices";
const CF_OPERATIONS: &str = "operations";
const CF_OUTBOX: &str = "outbox";

/// Index namespace: account journal order
const IDX_ACCOUNT_ENTRY: u8 = b'A';
/// Index namespace: entries owned by an operation
const IDX_OPERATION_ENTRY: u8 = b'O';

/// Staged writes applied atomically by [`Storage::commit`]
#[derive(Default)]
pub struct WriteSet {
    accounts: Vec<LedgerAccount>,
    entries: Vec<LedgerEntry>,
    operations: Vec<(Uuid, Vec<u8>)>,
    index_puts: Vec<(Vec<u8>, Vec<u8>)>,
    index_deletes: Vec<Vec<u8>>,
    outbox_puts: Vec<(Uuid, Vec<u8>)>,
    outbox_deletes: Vec<Uuid>,
}

impl WriteSet {
    /// Empty write set
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an operation row (opaque bytes)
    pub fn put_operation(&mut self, id: Uuid, bytes: Vec<u8>) {
        self.operations.push((id, bytes));
    }

    /// Stage a caller-owned index entry
    ///
    /// Keys in the ledger's own namespaces (`A`, `O`) are rejected at commit.
    pub fn put_index(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.index_puts.push((key, value));
    }

    /// Stage removal of a caller-owned index entry
    pub fn delete_index(&mut self, key: Vec<u8>) {
        self.index_deletes.push(key);
    }

    /// Stage an outbox record
    pub fn put_outbox(&mut self, event_id: Uuid, bytes: Vec<u8>) {
        self.outbox_puts.push((event_id, bytes));
    }

    /// Stage removal of a delivered outbox record
    pub fn delete_outbox(&mut self, event_id: Uuid) {
        self.outbox_deletes.push(event_id);
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.entries.is_empty()
            && self.operations.is_empty()
            && self.index_puts.is_empty()
            && self.index_deletes.is_empty()
            && self.outbox_puts.is_empty()
            && self.outbox_deletes.is_empty()
    }

    /// Fold another write set into this one
    pub fn extend(&mut self, other: WriteSet) {
        self.accounts.extend(other.accounts);
        self.entries.extend(other.entries);
        self.operations.extend(other.operations);
        self.index_puts.extend(other.index_puts);
        self.index_deletes.extend(other.index_deletes);
        self.outbox_puts.extend(other.outbox_puts);
        self.outbox_deletes.extend(other.outbox_deletes);
    }

    pub(crate) fn put_account(&mut self, account: LedgerAccount) {
        self.accounts.push(account);
    }

    /// New entries and status updates of existing ones
    pub(crate) fn put_entry(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }
}

impl fmt::Debug for WriteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSet")
            .field("accounts", &self.accounts.len())
            .field("entries", &self.entries.len())
            .field("operations", &self.operations.len())
            .field("index_puts", &self.index_puts.len())
            .field("index_deletes", &self.index_deletes.len())
            .field("outbox_puts", &self.outbox_puts.len())
            .field("outbox_deletes", &self.outbox_deletes.len())
            .finish()
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_OPERATIONS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_OUTBOX, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger storage");

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Frequently read and rewritten, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_cold() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Accounts

    /// Get account by key
    pub fn get_account(&self, key: &AccountKey) -> Result<Option<LedgerAccount>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        match self.db.get_cf(cf, key.storage_key())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All accounts of one owner, ordered by asset
    pub fn accounts_for_owner(&self, owner: &OwnerId) -> Result<Vec<LedgerAccount>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let prefix = AccountKey::owner_prefix(owner);

        let mut accounts = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, &prefix) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            accounts.push(bincode::deserialize(&value)?);
        }
        Ok(accounts)
    }

    // Entries

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let value = self
            .db
            .get_cf(cf, entry_id.as_bytes())?
            .ok_or(Error::EntryNotFound(entry_id))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Journal of one account in sequence order
    pub fn account_entries(&self, account: &AccountKey) -> Result<Vec<LedgerEntry>> {
        let prefix = Self::index_key_account_entry(account, None);
        self.scan_index(&prefix)?
            .into_iter()
            .map(|(_, value)| self.get_entry(Self::uuid_from(&value)?))
            .collect()
    }

    /// Entries owned by one operation, oldest first
    pub fn operation_entries(&self, operation_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let prefix = Self::index_key_operation_entry(operation_id, None);
        let mut entries = self
            .scan_index(&prefix)?
            .into_iter()
            .map(|(key, _)| self.get_entry(Self::uuid_from(&key[prefix.len()..])?))
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sequence.cmp(&b.sequence)));
        Ok(entries)
    }

    // Operations (opaque to the ledger)

    /// Raw operation row
    pub fn get_operation(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(CF_OPERATIONS)?;
        Ok(self.db.get_cf(cf, id.as_bytes())?)
    }

    // Indices

    /// Value of one index entry
    pub fn get_index(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(CF_INDICES)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    /// All index entries under `prefix`, in key order
    pub fn scan_index(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    // Outbox

    /// Oldest outbox records first, at most `limit`
    pub fn scan_outbox(&self, limit: usize) -> Result<Vec<(Uuid, Vec<u8>)>> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start).take(limit) {
            let (key, value) = item?;
            out.push((Self::uuid_from(&key)?, value.to_vec()));
        }
        Ok(out)
    }

    // Batch operations (atomic)

    /// Apply a write set as one RocksDB write batch
    pub fn commit(&self, set: WriteSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        for account in &set.accounts {
            batch.put_cf(
                cf_accounts,
                account.key.storage_key(),
                bincode::serialize(account)?,
            );
        }

        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;
        for entry in &set.entries {
            batch.put_cf(
                cf_entries,
                entry.entry_id.as_bytes(),
                bincode::serialize(entry)?,
            );

            // Index: account || sequence -> entry_id
            let idx_account = Self::index_key_account_entry(&entry.account, Some(entry.sequence));
            batch.put_cf(cf_indices, idx_account, entry.entry_id.as_bytes());

            // Index: operation_id || entry_id -> empty
            let idx_operation =
                Self::index_key_operation_entry(entry.operation_id, Some(entry.entry_id));
            batch.put_cf(cf_indices, idx_operation, b"");
        }

        for (key, value) in &set.index_puts {
            Self::ensure_caller_namespace(key)?;
            batch.put_cf(cf_indices, key, value);
        }
        for key in &set.index_deletes {
            Self::ensure_caller_namespace(key)?;
            batch.delete_cf(cf_indices, key);
        }

        let cf_operations = self.cf_handle(CF_OPERATIONS)?;
        for (id, bytes) in &set.operations {
            batch.put_cf(cf_operations, id.as_bytes(), bytes);
        }

        let cf_outbox = self.cf_handle(CF_OUTBOX)?;
        for (event_id, bytes) in &set.outbox_puts {
            batch.put_cf(cf_outbox, event_id.as_bytes(), bytes);
        }
        for event_id in &set.outbox_deletes {
            batch.delete_cf(cf_outbox, event_id.as_bytes());
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        tracing::trace!(?set, "Write set committed");
        Ok(())
    }

    // Index key helpers

    fn index_key_account_entry(account: &AccountKey, sequence: Option<u64>) -> Vec<u8> {
        let account_key = account.storage_key();
        let mut key = Vec::with_capacity(1 + 2 + account_key.len() + 8);
        key.push(IDX_ACCOUNT_ENTRY);
        // Length prefix so "BTC" never prefix-matches "BTCX"
        key.extend_from_slice(&(account_key.len() as u16).to_be_bytes());
        key.extend_from_slice(&account_key);
        if let Some(seq) = sequence {
            key.extend_from_slice(&seq.to_be_bytes());
        }
        key
    }

    fn index_key_operation_entry(operation_id: Uuid, entry_id: Option<Uuid>) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(IDX_OPERATION_ENTRY);
        key.extend_from_slice(operation_id.as_bytes());
        if let Some(eid) = entry_id {
            key.extend_from_slice(eid.as_bytes());
        }
        key
    }

    fn ensure_caller_namespace(key: &[u8]) -> Result<()> {
        match key.first() {
            Some(&IDX_ACCOUNT_ENTRY) | Some(&IDX_OPERATION_ENTRY) | None => Err(Error::Storage(
                format!("index key {:?} is in a reserved namespace", key),
            )),
            Some(_) => Ok(()),
        }
    }

    fn uuid_from(bytes: &[u8]) -> Result<Uuid> {
        Uuid::from_slice(bytes).map_err(|e| Error::Storage(format!("corrupt uuid key: {}", e)))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_accounts: self.approximate_count(self.cf_handle(CF_ACCOUNTS)?)?,
            total_entries: self.approximate_count(self.cf_handle(CF_ENTRIES)?)?,
            total_operations: self.approximate_count(self.cf_handle(CF_OPERATIONS)?)?,
            pending_outbox: self.approximate_count(self.cf_handle(CF_OUTBOX)?)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate number of accounts
    pub total_accounts: u64,
    /// Approximate number of journal entries
    pub total_entries: u64,
    /// Approximate number of operation rows
    pub total_operations: u64,
    /// Approximate number of undelivered outbox records
    pub pending_outbox: u64,
}
