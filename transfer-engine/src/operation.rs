//! Operation record, kinds, statuses and events
//!
//! Every transfer-like entity is an [`Operation`]: a shared core record plus a
//! kind-specific [`Payload`]. The payload variant is the kind tag.

use chrono::{DateTime, Utc};
use ledger_core::{AccountKey, AssetCode, OwnerId, Posting};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Prefix of the explanation carried by operations awaiting an operator
pub const MANUAL_INTERVENTION: &str = "manual intervention required";

/// Concrete operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    /// Incoming funds credited after verification
    Deposit,
    /// Outgoing funds, parent of one relay
    Withdrawal,
    /// External payout step of a withdrawal
    WithdrawalRelay,
    /// Owner-to-owner move of one asset
    InternalTransfer,
    /// Funds held for a beneficiary
    EscrowFreeze,
    /// Request to return escrowed funds to the owner
    EscrowUnfreeze,
    /// Freeze of a whole wallet snapshot
    BalanceLock,
    /// Per-asset execution record of a balance lock
    BalanceLockOperation,
}

impl OperationKind {
    /// All kinds
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Deposit,
        OperationKind::Withdrawal,
        OperationKind::WithdrawalRelay,
        OperationKind::InternalTransfer,
        OperationKind::EscrowFreeze,
        OperationKind::EscrowUnfreeze,
        OperationKind::BalanceLock,
        OperationKind::BalanceLockOperation,
    ];

    /// snake_case name used in topics, logs and config
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "deposit",
            OperationKind::Withdrawal => "withdrawal",
            OperationKind::WithdrawalRelay => "withdrawal_relay",
            OperationKind::InternalTransfer => "internal_transfer",
            OperationKind::EscrowFreeze => "escrow_freeze",
            OperationKind::EscrowUnfreeze => "escrow_unfreeze",
            OperationKind::BalanceLock => "balance_lock",
            OperationKind::BalanceLockOperation => "balance_lock_operation",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation status, shared by all kinds
///
/// Each kind's graph uses a subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    /// Initial state of every kind
    Pending,
    /// Deposit credited
    Verified,
    /// Deposit judged fraudulent
    Forged,
    /// Deposit held back; may still be verified
    Rejected,
    /// Work handed to a child or external system
    Processing,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Cancelled before finishing
    Cancelled,
    /// External call in progress (recovery anchor)
    Relaying,
    /// External system accepted the relay
    Processed,
    /// External system rejected the relay
    RelayFailed,
    /// Relay outcome unknown
    RelayCrashed,
    /// Relay given up
    Abandoned,
    /// Escrow holding funds
    Active,
    /// Funds returned to the owner
    Released,
    /// Escrow paid out to the beneficiary
    Claimed,
    /// Balance lock holding funds
    Locked,
    /// Balance lock release in progress
    Releasing,
}

impl Status {
    /// All statuses
    pub const ALL: [Status; 18] = [
        Status::Pending,
        Status::Verified,
        Status::Forged,
        Status::Rejected,
        Status::Processing,
        Status::Completed,
        Status::Failed,
        Status::Cancelled,
        Status::Relaying,
        Status::Processed,
        Status::RelayFailed,
        Status::RelayCrashed,
        Status::Abandoned,
        Status::Active,
        Status::Released,
        Status::Claimed,
        Status::Locked,
        Status::Releasing,
    ];

    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Verified => "verified",
            Status::Forged => "forged",
            Status::Rejected => "rejected",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Relaying => "relaying",
            Status::Processed => "processed",
            Status::RelayFailed => "relay_failed",
            Status::RelayCrashed => "relay_crashed",
            Status::Abandoned => "abandoned",
            Status::Active => "active",
            Status::Released => "released",
            Status::Claimed => "claimed",
            Status::Locked => "locked",
            Status::Releasing => "releasing",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by the operation graphs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Event {
    /// Deposit: accept and credit
    Verify,
    /// Deposit: mark fraudulent
    Forge,
    /// Deposit: hold back
    Reject,
    /// Hand off to the next stage
    Process,
    /// Finish successfully
    Complete,
    /// Finish unsuccessfully
    Fail,
    /// Cancel
    Cancel,
    /// Relay: persist the in-flight marker
    StartRelaying,
    /// Relay: external success
    Relay,
    /// Relay: ambiguous outcome
    Crash,
    /// Relay: give up
    Abandon,
    /// Escrow: start holding
    Activate,
    /// Return held funds
    Release,
    /// Escrow: pay the beneficiary
    Claim,
    /// Balance lock: freeze the snapshot
    Lock,
    /// Balance lock: begin release
    StartReleasing,
}

impl Event {
    /// All events
    pub const ALL: [Event; 16] = [
        Event::Verify,
        Event::Forge,
        Event::Reject,
        Event::Process,
        Event::Complete,
        Event::Fail,
        Event::Cancel,
        Event::StartRelaying,
        Event::Relay,
        Event::Crash,
        Event::Abandon,
        Event::Activate,
        Event::Release,
        Event::Claim,
        Event::Lock,
        Event::StartReleasing,
    ];

    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Verify => "verify",
            Event::Forge => "forge",
            Event::Reject => "reject",
            Event::Process => "process",
            Event::Complete => "complete",
            Event::Fail => "fail",
            Event::Cancel => "cancel",
            Event::StartRelaying => "start_relaying",
            Event::Relay => "relay",
            Event::Crash => "crash",
            Event::Abandon => "abandon",
            Event::Activate => "activate",
            Event::Release => "release",
            Event::Claim => "claim",
            Event::Lock => "lock",
            Event::StartReleasing => "start_releasing",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from a child operation to the entity it reports to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentRef {
    /// Another operation in this engine
    Operation(Uuid),
    /// An aggregate owned elsewhere (e.g. a trade)
    External {
        /// Entity type, e.g. `trade`
        kind: String,
        /// Entity id in the owning system
        id: String,
    },
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentRef::Operation(id) => write!(f, "operation:{}", id),
            ParentRef::External { kind, id } => write!(f, "{}:{}", kind, id),
        }
    }
}

/// Direction of a balance lock execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockAction {
    /// Freezing the asset
    Lock,
    /// Releasing the asset
    Release,
}

/// Kind-specific data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Deposit
    Deposit {
        /// External transaction reference
        txid: Option<String>,
    },
    /// Withdrawal
    Withdrawal {
        /// Payout destination
        destination: String,
    },
    /// Relay step of a withdrawal
    WithdrawalRelay {
        /// Payout destination
        destination: String,
        /// Relay attempts started so far
        attempts: u32,
        /// When the last attempt started
        last_attempt_at: Option<DateTime<Utc>>,
    },
    /// Internal transfer
    InternalTransfer {
        /// Owner receiving the funds
        receiver: OwnerId,
    },
    /// Escrow hold
    EscrowFreeze {
        /// Owner paid on claim
        beneficiary: OwnerId,
    },
    /// Escrow return request
    EscrowUnfreeze,
    /// Wallet snapshot lock
    BalanceLock {
        /// Asset -> amount frozen at lock time
        amounts: BTreeMap<AssetCode, Decimal>,
    },
    /// Per-asset balance lock record
    BalanceLockOperation {
        /// Lock or release
        action: LockAction,
    },
}

impl Payload {
    /// Kind tag of this payload
    pub fn kind(&self) -> OperationKind {
        match self {
            Payload::Deposit { .. } => OperationKind::Deposit,
            Payload::Withdrawal { .. } => OperationKind::Withdrawal,
            Payload::WithdrawalRelay { .. } => OperationKind::WithdrawalRelay,
            Payload::InternalTransfer { .. } => OperationKind::InternalTransfer,
            Payload::EscrowFreeze { .. } => OperationKind::EscrowFreeze,
            Payload::EscrowUnfreeze => OperationKind::EscrowUnfreeze,
            Payload::BalanceLock { .. } => OperationKind::BalanceLock,
            Payload::BalanceLockOperation { .. } => OperationKind::BalanceLockOperation,
        }
    }
}

/// Work queued by an after-hook, run once the operation lock is released
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    /// Fire `event` on the parent if it accepts it
    NotifyParent {
        /// Child whose terminal state is propagated
        child: Uuid,
        /// Parent reference
        parent: ParentRef,
        /// Event for the parent
        event: Event,
    },
    /// Fire `event` on another operation if it accepts it
    Fire {
        /// Target operation
        operation_id: Uuid,
        /// Event to fire
        event: Event,
    },
}

/// Effects a before-hook stages for the commit of its transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Staged {
    /// Ledger postings committed with the status write
    pub postings: Vec<Posting>,
    /// Child operations created with the status write
    pub children: Vec<Operation>,
    /// Existing operations rewritten with the status write
    pub updated: Vec<Operation>,
    /// Work for after the operation lock is released
    pub follow_ups: Vec<FollowUp>,
}

/// Operation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation ID (UUIDv7, also the external idempotency key)
    pub id: Uuid,

    /// Owner whose funds move
    pub owner: OwnerId,

    /// Asset, absent for multi-asset balance locks
    pub asset: Option<AssetCode>,

    /// Principal amount (zero for balance locks, see payload)
    pub amount: Decimal,

    /// Fee charged on success
    pub fee: Decimal,

    /// Current status
    pub status: Status,

    /// Human-readable explanation of the latest failure or parking
    pub status_explanation: Option<String>,

    /// Entity notified of this operation's terminal state
    pub parent: Option<ParentRef>,

    /// Caller-supplied metadata
    pub metadata: BTreeMap<String, String>,

    /// Kind-specific data
    pub payload: Payload,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last transition timestamp (never decreases)
    pub updated_at: DateTime<Utc>,

    /// Number of writes after creation
    pub revision: u64,

    /// Staged transition effects, never persisted
    #[serde(skip)]
    pub staged: Staged,
}

impl Operation {
    /// New operation in `pending`
    pub fn new(
        owner: OwnerId,
        asset: Option<AssetCode>,
        amount: Decimal,
        payload: Payload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner,
            asset,
            amount,
            fee: Decimal::ZERO,
            status: Status::Pending,
            status_explanation: None,
            parent: None,
            metadata: BTreeMap::new(),
            payload,
            created_at: now,
            updated_at: now,
            revision: 0,
            staged: Staged::default(),
        }
    }

    /// Kind tag
    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// Owner's account in the operation's asset
    pub fn account(&self) -> Option<AccountKey> {
        self.asset
            .as_ref()
            .map(|asset| AccountKey {
                owner: self.owner.clone(),
                asset: asset.clone(),
            })
    }

    /// Amount reserved on creation: principal plus fee
    pub fn reserved_total(&self) -> Decimal {
        self.amount + self.fee
    }

    /// Parent operation id, when the parent lives in this engine
    pub fn parent_operation(&self) -> Option<Uuid> {
        match &self.parent {
            Some(ParentRef::Operation(id)) => Some(*id),
            _ => None,
        }
    }

    /// Relay attempts made so far (zero for other kinds)
    pub fn relay_attempts(&self) -> u32 {
        match &self.payload {
            Payload::WithdrawalRelay { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Public view of the operation
    pub fn snapshot(&self) -> OperationSnapshot {
        let amounts = match (&self.payload, &self.asset) {
            (Payload::BalanceLock { amounts }, _) => amounts.clone(),
            (_, Some(asset)) => BTreeMap::from([(asset.clone(), self.amount)]),
            (_, None) => BTreeMap::new(),
        };

        OperationSnapshot {
            id: self.id,
            kind: self.kind(),
            owner: self.owner.clone(),
            status: self.status,
            amounts,
            fee: self.fee,
            parent: self.parent.clone(),
            error: self.status_explanation.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Whether the operation has been parked for an operator
    pub fn needs_manual_intervention(&self) -> bool {
        self.status_explanation
            .as_deref()
            .map_or(false, |e| e.starts_with(MANUAL_INTERVENTION))
    }

    /// Bump the revision and advance `updated_at`, keeping it monotonic
    pub(crate) fn touch(&mut self) {
        self.revision += 1;
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }
}

/// Read-only view returned to callers and published on the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    /// Operation ID
    pub id: Uuid,
    /// Kind
    pub kind: OperationKind,
    /// Owner
    pub owner: OwnerId,
    /// Status
    pub status: Status,
    /// Amount per asset
    pub amounts: BTreeMap<AssetCode, Decimal>,
    /// Fee
    pub fee: Decimal,
    /// Parent reference
    pub parent: Option<ParentRef>,
    /// Failure explanation
    pub error: Option<String>,
    /// Caller metadata
    pub metadata: BTreeMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last transition timestamp
    pub updated_at: DateTime<Utc>,
}
