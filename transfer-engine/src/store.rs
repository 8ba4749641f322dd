//! Operation persistence on top of the ledger's storage
//!
//! Operation rows live in the `operations` column family; this module owns the
//! index namespaces below and the outbox record format.
//!
//! - `P || parent_id || child_id` - children of an operation
//! - `W || owner_len || owner || operation_id` - operations of an owner
//! - `R || operation_id` - relay operations the recovery sweep must visit
//! - `M || operation_id` - relays parked for manual intervention
//! - `U || operation_id -> revision` - committed transitions whose after-hook
//!   follow-ups have not all succeeded yet

use crate::{
    operation::{Operation, OperationKind, Status},
    Error, Result,
};
use chrono::{DateTime, Utc};
use ledger_core::{Ledger, OwnerId, WriteSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const IDX_CHILD: u8 = b'P';
const IDX_OWNER: u8 = b'W';
const IDX_RELAY_WATCH: u8 = b'R';
const IDX_PARKED: u8 = b'M';
const IDX_UNSETTLED: u8 = b'U';

/// Relay statuses the sweep revisits
const RELAY_WATCH_STATUSES: [Status; 4] = [
    Status::Pending,
    Status::Relaying,
    Status::RelayFailed,
    Status::RelayCrashed,
];

/// Event waiting in the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Deduplication key for consumers (UUIDv7)
    pub event_id: Uuid,
    /// `operation.<kind>.<status>`
    pub topic: String,
    /// JSON-encoded [`crate::OperationSnapshot`]
    pub payload: String,
    /// When the record was staged
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Record announcing the current state of `op`
    pub fn for_operation(op: &Operation) -> Result<Self> {
        Ok(Self {
            event_id: Uuid::now_v7(),
            topic: format!("operation.{}.{}", op.kind(), op.status),
            payload: serde_json::to_string(&op.snapshot())?,
            created_at: Utc::now(),
        })
    }
}

/// Typed access to operation rows and indices
#[derive(Debug, Clone)]
pub struct OperationStore {
    ledger: Arc<Ledger>,
}

impl OperationStore {
    /// Create store over a ledger
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Load an operation or fail with `OperationNotFound`
    pub fn load(&self, id: Uuid) -> Result<Operation> {
        self.find(id)?.ok_or(Error::OperationNotFound(id))
    }

    /// Load an operation if it exists
    pub fn find(&self, id: Uuid) -> Result<Option<Operation>> {
        match self.ledger.storage().get_operation(id)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stage the row, its indices and a status event
    pub fn stage(&self, set: &mut WriteSet, op: &Operation, is_new: bool) -> Result<()> {
        set.put_operation(op.id, bincode::serialize(op)?);

        if is_new {
            set.put_index(Self::owner_key(&op.owner, Some(op.id)), Vec::new());
            if let Some(parent) = op.parent_operation() {
                set.put_index(Self::child_key(parent, Some(op.id)), Vec::new());
            }
        }

        if op.kind() == OperationKind::WithdrawalRelay {
            // Parked relays leave the sweep until an operator resolves them
            let open = RELAY_WATCH_STATUSES.contains(&op.status);
            let parked = open && op.needs_manual_intervention();
            let watch_key = Self::namespace_key(IDX_RELAY_WATCH, Some(op.id));
            Self::toggle(set, watch_key, open && !parked);
            Self::toggle(set, Self::namespace_key(IDX_PARKED, Some(op.id)), parked);
        }

        let record = OutboxRecord::for_operation(op)?;
        set.put_outbox(record.event_id, bincode::serialize(&record)?);
        Ok(())
    }

    /// Children of an operation, oldest first
    pub fn children(&self, parent: Uuid) -> Result<Vec<Operation>> {
        let prefix = Self::child_key(parent, None);
        self.load_suffixes(&prefix)
    }

    /// Ids of the children of an operation, oldest first
    pub fn child_ids(&self, parent: Uuid) -> Result<Vec<Uuid>> {
        let prefix = Self::child_key(parent, None);
        self.ledger
            .storage()
            .scan_index(&prefix)?
            .into_iter()
            .map(|(key, _)| Self::id_suffix(&key, prefix.len()))
            .collect()
    }

    /// Operations of an owner, oldest first
    pub fn for_owner(&self, owner: &OwnerId) -> Result<Vec<Operation>> {
        let prefix = Self::owner_key(owner, None);
        self.load_suffixes(&prefix)
    }

    /// Relay operations in a status the sweep handles
    pub fn relay_watch(&self) -> Result<Vec<Operation>> {
        self.load_suffixes(&Self::namespace_key(IDX_RELAY_WATCH, None))
    }

    /// Relays waiting for an operator
    pub fn parked(&self) -> Result<Vec<Operation>> {
        self.load_suffixes(&Self::namespace_key(IDX_PARKED, None))
    }

    /// Stage the marker for a transition whose after-hook has yet to run
    pub fn stage_unsettled(&self, set: &mut WriteSet, op: &Operation) {
        let revision = op.revision.to_be_bytes().to_vec();
        set.put_index(Self::unsettled_key(Some(op.id)), revision);
    }

    /// Operations with after-hook follow-ups that may not have run
    pub fn unsettled(&self) -> Result<Vec<Uuid>> {
        let prefix = Self::unsettled_key(None);
        self.ledger
            .storage()
            .scan_index(&prefix)?
            .into_iter()
            .map(|(key, _)| Self::id_suffix(&key, prefix.len()))
            .collect()
    }

    /// Drop the marker of `id` unless a transition after `revision` set it
    ///
    /// Callers hold the operation lock.
    pub fn clear_unsettled(&self, id: Uuid, revision: u64) -> Result<bool> {
        let key = Self::unsettled_key(Some(id));
        let Some(value) = self.ledger.storage().get_index(&key)? else {
            return Ok(false);
        };
        let marked = <[u8; 8]>::try_from(value.as_slice())
            .map(u64::from_be_bytes)
            .map_err(|_| Error::Serialization(format!("corrupt unsettled marker for {}", id)))?;
        if marked > revision {
            return Ok(false);
        }

        let mut set = WriteSet::new();
        set.delete_index(key);
        self.ledger.commit_records(set)?;
        Ok(true)
    }

    /// Oldest undelivered outbox records
    pub fn pending_events(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        self.ledger
            .storage()
            .scan_outbox(limit)?
            .into_iter()
            .map(|(_, bytes)| -> Result<OutboxRecord> { Ok(bincode::deserialize(&bytes)?) })
            .collect()
    }

    /// Remove a delivered outbox record
    pub fn ack_event(&self, event_id: Uuid) -> Result<()> {
        let mut set = WriteSet::new();
        set.delete_outbox(event_id);
        self.ledger.commit_records(set)?;
        Ok(())
    }

    fn load_suffixes(&self, prefix: &[u8]) -> Result<Vec<Operation>> {
        self.ledger
            .storage()
            .scan_index(prefix)?
            .into_iter()
            .map(|(key, _)| self.load(Self::id_suffix(&key, prefix.len())?))
            .collect()
    }

    fn id_suffix(key: &[u8], prefix_len: usize) -> Result<Uuid> {
        Uuid::from_slice(&key[prefix_len..])
            .map_err(|e| Error::Serialization(format!("corrupt index key: {}", e)))
    }

    fn toggle(set: &mut WriteSet, key: Vec<u8>, present: bool) {
        if present {
            set.put_index(key, Vec::new());
        } else {
            set.delete_index(key);
        }
    }

    fn child_key(parent: Uuid, child: Option<Uuid>) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(IDX_CHILD);
        key.extend_from_slice(parent.as_bytes());
        if let Some(child) = child {
            key.extend_from_slice(child.as_bytes());
        }
        key
    }

    fn owner_key(owner: &OwnerId, id: Option<Uuid>) -> Vec<u8> {
        let owner = owner.as_str().as_bytes();
        let mut key = Vec::with_capacity(1 + 2 + owner.len() + 16);
        key.push(IDX_OWNER);
        key.extend_from_slice(&(owner.len() as u16).to_be_bytes());
        key.extend_from_slice(owner);
        if let Some(id) = id {
            key.extend_from_slice(id.as_bytes());
        }
        key
    }

    fn namespace_key(namespace: u8, id: Option<Uuid>) -> Vec<u8> {
        let mut key = vec![namespace];
        if let Some(id) = id {
            key.extend_from_slice(id.as_bytes());
        }
        key
    }

    fn unsettled_key(id: Option<Uuid>) -> Vec<u8> {
        Self::namespace_key(IDX_UNSETTLED, id)
    }
}
