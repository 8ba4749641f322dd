//! Transfer orchestrator
//!
//! Owns the lifecycle of every operation: validation, the atomic
//! create-and-reserve unit, event dispatch through the kind's state machine,
//! and the follow-up work after-hooks queue (parent notification and child
//! driving).
//!
//! A transition runs under the lock of its operation and the locks of that
//! operation's children, taken parent first. Follow-ups run after those locks
//! are released, so a child notifying its parent never holds both.
//!
//! A transition with an after-hook commits an unsettled marker in its own
//! write batch. The marker is cleared once every follow-up of that transition
//! succeeded; [`TransferOrchestrator::settle_pending`] replays the after-hooks
//! of whatever is still marked, so a crash or a failing collaborator between
//! commit and follow-up only delays the follow-up.

use crate::{
    config::Config,
    context::EngineContext,
    graphs::Graphs,
    interfaces::{
        AcceptAllDeposits, AssetRegistry, DepositVerifier, NoExternalParents, ParentHandle,
        ParentLookup, StaticAssetRegistry,
    },
    machine::Fired,
    metrics::EngineMetrics,
    operation::{
        Event, FollowUp, Operation, OperationKind, OperationSnapshot, ParentRef, Payload, Status,
    },
    store::OperationStore,
    sync::{self, CrossEntitySync, Delivery},
    Error, Result,
};
use ledger_core::{
    AccountBalances, AccountKey, AssetCode, KeyGuard, KeyedLocks, Ledger, OwnerId, Posting,
    WriteSet,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Kind-specific part of a transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferKind {
    /// Incoming funds
    Deposit {
        /// External transaction reference
        txid: Option<String>,
    },
    /// Outgoing funds
    Withdrawal {
        /// Payout destination
        destination: String,
    },
    /// Owner-to-owner move
    InternalTransfer {
        /// Receiving owner
        receiver: OwnerId,
    },
    /// Hold for a beneficiary
    EscrowFreeze {
        /// Owner paid on claim
        beneficiary: OwnerId,
    },
}

/// Transfer request
#[derive(Debug, Clone)]
pub struct NewTransfer {
    /// What to create
    pub kind: TransferKind,
    /// Owner whose funds move
    pub owner: OwnerId,
    /// Asset
    pub asset: AssetCode,
    /// Principal amount
    pub amount: Decimal,
    /// Caller metadata
    pub metadata: BTreeMap<String, String>,
    /// External entity notified of the terminal state (e.g. a trade)
    pub parent: Option<ParentRef>,
}

impl NewTransfer {
    /// Request without metadata or parent
    pub fn new(
        kind: TransferKind,
        owner: impl Into<String>,
        asset: impl AsRef<str>,
        amount: Decimal,
    ) -> Self {
        Self {
            kind,
            owner: OwnerId::new(owner),
            asset: AssetCode::new(asset),
            amount,
            metadata: BTreeMap::new(),
            parent: None,
        }
    }

    /// Attach an external parent
    pub fn with_parent(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.parent = Some(ParentRef::External {
            kind: kind.into(),
            id: id.into(),
        });
        self
    }

    /// Attach one metadata pair
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Injected collaborators
#[derive(Clone)]
pub struct Collaborators {
    /// Asset support and fee table
    pub registry: Arc<dyn AssetRegistry>,
    /// Deposit verification predicate
    pub verifier: Arc<dyn DepositVerifier>,
    /// Parents outside this engine
    pub parent_lookup: Arc<dyn ParentLookup>,
}

impl Collaborators {
    /// Config-backed registry, accept-all verifier, no external parents
    pub fn from_config(config: &Config) -> Self {
        Self {
            registry: Arc::new(StaticAssetRegistry::new(&config.assets)),
            verifier: Arc::new(AcceptAllDeposits),
            parent_lookup: Arc::new(NoExternalParents),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Transfer orchestrator
pub struct TransferOrchestrator {
    ctx: EngineContext,
    graphs: Graphs,
    op_locks: KeyedLocks<Uuid>,
    sync: CrossEntitySync,
}

impl fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("ctx", &self.ctx)
            .field("op_locks", &self.op_locks)
            .finish_non_exhaustive()
    }
}

impl TransferOrchestrator {
    /// Create on top of an open ledger
    pub fn new(ledger: Arc<Ledger>, config: &Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let metrics = EngineMetrics::new().map_err(|e| Error::Config(format!("metrics: {}", e)))?;

        let ctx = EngineContext {
            store: OperationStore::new(ledger.clone()),
            ledger,
            registry: collaborators.registry,
            verifier: collaborators.verifier,
            fee_collector: config.fee_collector.as_deref().map(OwnerId::new),
            max_relay_attempts: config.relay.max_attempts,
            metrics,
        };

        Ok(Self {
            ctx,
            graphs: Graphs::new(),
            op_locks: KeyedLocks::new(),
            sync: CrossEntitySync::new(collaborators.parent_lookup),
        })
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ctx.ledger
    }

    /// Engine metrics
    pub fn metrics(&self) -> &EngineMetrics {
        &self.ctx.metrics
    }

    /// Operation store
    pub fn store(&self) -> &OperationStore {
        &self.ctx.store
    }

    /// State graphs
    pub fn graphs(&self) -> &Graphs {
        &self.graphs
    }

    /// Create a transfer and return its id
    pub fn create_transfer(
        &self,
        kind: TransferKind,
        owner: OwnerId,
        asset: AssetCode,
        amount: Decimal,
        metadata: BTreeMap<String, String>,
    ) -> Result<Uuid> {
        let request = NewTransfer {
            kind,
            owner,
            asset,
            amount,
            metadata,
            parent: None,
        };
        Ok(self.create(request)?.id)
    }

    /// Validate, reserve amount plus fee and persist the operation in one unit
    ///
    /// Deposits reserve nothing; they credit on verification.
    pub fn create(&self, request: NewTransfer) -> Result<OperationSnapshot> {
        let NewTransfer {
            kind,
            owner,
            asset,
            amount,
            metadata,
            parent,
        } = request;

        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!("amount must be positive, got {}", amount)));
        }
        if !self.ctx.registry.is_asset_supported(&asset) {
            return Err(Error::Validation(format!("asset {} is not supported", asset)));
        }

        let payload = match kind {
            TransferKind::Deposit { txid } => Payload::Deposit { txid },
            TransferKind::Withdrawal { destination } => {
                if destination.trim().is_empty() {
                    return Err(Error::Validation("withdrawal destination is empty".into()));
                }
                Payload::Withdrawal { destination }
            }
            TransferKind::InternalTransfer { receiver } => {
                if receiver == owner {
                    return Err(Error::Validation("cannot transfer to the same owner".into()));
                }
                Payload::InternalTransfer { receiver }
            }
            TransferKind::EscrowFreeze { beneficiary } => {
                if beneficiary == owner {
                    return Err(Error::Validation("owner cannot be its own beneficiary".into()));
                }
                Payload::EscrowFreeze { beneficiary }
            }
        };

        let mut op = Operation::new(owner, Some(asset.clone()), amount, payload);
        op.fee = self.ctx.registry.fee_for(&asset, op.kind());
        op.metadata = metadata;
        op.parent = parent;

        if op.fee.is_sign_negative() {
            return Err(Error::Validation(format!("negative fee {} for {}", op.fee, op.kind())));
        }
        if !op.fee.is_zero() && self.ctx.fee_collector.is_none() {
            return Err(Error::Config("fee charged but no fee_collector configured".into()));
        }

        let postings = match op.kind() {
            OperationKind::Deposit => {
                if op.fee >= op.amount {
                    return Err(Error::Validation(format!(
                        "deposit amount {} does not cover fee {}",
                        op.amount, op.fee
                    )));
                }
                Vec::new()
            }
            _ => {
                let account = AccountKey {
                    owner: op.owner.clone(),
                    asset,
                };
                account.validate()?;
                vec![Posting::reserve(account, op.reserved_total(), op.id)]
            }
        };

        self.insert(op, postings)
    }

    /// Fire `event` and run the follow-up work it queues
    pub fn advance(&self, id: Uuid, event: Event) -> Result<OperationSnapshot> {
        self.fire(id, event, |_| {})?;
        self.get_operation(id)
    }

    /// Cancel a non-terminal operation, releasing whatever it reserved
    pub fn cancel(&self, id: Uuid, reason: &str) -> Result<OperationSnapshot> {
        let reason = reason.to_string();
        self.fire(id, Event::Cancel, move |op| op.status_explanation = Some(reason))?;
        self.get_operation(id)
    }

    /// Alias of [`cancel`](Self::cancel) discarding the snapshot
    pub fn cancel_transfer(&self, id: Uuid, reason: &str) -> Result<()> {
        self.cancel(id, reason).map(|_| ())
    }

    /// Snapshot of one operation
    pub fn get_operation(&self, id: Uuid) -> Result<OperationSnapshot> {
        Ok(self.ctx.store.load(id)?.snapshot())
    }

    /// Balances of one account (zero if never touched)
    pub fn get_account_balances(
        &self,
        owner: &OwnerId,
        asset: &AssetCode,
    ) -> Result<AccountBalances> {
        let key = AccountKey {
            owner: owner.clone(),
            asset: asset.clone(),
        };
        Ok(self.ctx.ledger.balances(&key)?)
    }

    /// Balances of every account an owner holds
    pub fn balances_for_owner(&self, owner: &OwnerId) -> Result<Vec<(AssetCode, AccountBalances)>> {
        Ok(self.ctx.ledger.balances_for_owner(owner)?)
    }

    /// Child operations of `parent`, oldest first
    pub fn children(&self, parent: Uuid) -> Result<Vec<OperationSnapshot>> {
        Ok(self.ctx.store.children(parent)?.iter().map(Operation::snapshot).collect())
    }

    /// Operations of an owner, oldest first
    pub fn operations_for_owner(&self, owner: &OwnerId) -> Result<Vec<OperationSnapshot>> {
        Ok(self.ctx.store.for_owner(owner)?.iter().map(Operation::snapshot).collect())
    }

    /// Open an unfreeze request on an active escrow
    pub fn request_unfreeze(
        &self,
        escrow_id: Uuid,
        metadata: BTreeMap<String, String>,
    ) -> Result<OperationSnapshot> {
        let _guard = self.op_locks.lock(&escrow_id);

        let escrow = self.ctx.store.load(escrow_id)?;
        if escrow.kind() != OperationKind::EscrowFreeze {
            return Err(Error::Validation(format!("operation {} is not an escrow", escrow_id)));
        }
        if escrow.status != Status::Active {
            return Err(Error::InvalidTransition {
                kind: "escrow_freeze",
                status: escrow.status.to_string(),
                event: "request_unfreeze".to_string(),
            });
        }
        let unfreezes = self.graphs.for_kind(OperationKind::EscrowUnfreeze);
        let open = self
            .ctx
            .store
            .children(escrow_id)?
            .into_iter()
            .any(|child| {
                child.kind() == OperationKind::EscrowUnfreeze
                    && !unfreezes.is_terminal(child.status)
            });
        if open {
            return Err(Error::Validation(format!(
                "escrow {} already has an open unfreeze",
                escrow_id
            )));
        }

        let mut unfreeze = Operation::new(
            escrow.owner.clone(),
            escrow.asset.clone(),
            escrow.amount,
            Payload::EscrowUnfreeze,
        );
        unfreeze.parent = Some(ParentRef::Operation(escrow_id));
        unfreeze.metadata = metadata;
        self.insert(unfreeze, Vec::new())
    }

    /// Freeze every non-zero available balance of `owner` as one unit
    ///
    /// When the lock loses a race for funds the operation ends `failed` with
    /// the reason in its `error` field.
    pub fn lock_balances(
        &self,
        owner: &OwnerId,
        metadata: BTreeMap<String, String>,
    ) -> Result<OperationSnapshot> {
        let amounts: BTreeMap<AssetCode, Decimal> = self
            .ctx
            .ledger
            .balances_for_owner(owner)?
            .into_iter()
            .filter(|(_, balances)| balances.available_balance > Decimal::ZERO)
            .map(|(asset, balances)| (asset, balances.available_balance))
            .collect();
        if amounts.is_empty() {
            return Err(Error::Validation(format!(
                "owner {} has no available balance to lock",
                owner
            )));
        }

        let payload = Payload::BalanceLock { amounts };
        let mut lock = Operation::new(owner.clone(), None, Decimal::ZERO, payload);
        lock.metadata = metadata;
        let id = self.insert(lock, Vec::new())?.id;

        match self.fire(id, Event::Lock, |_| {}) {
            Ok(()) => self.get_operation(id),
            Err(err @ Error::InsufficientFunds { .. }) => {
                warn!(operation_id = %id, error = %err, "Balance lock lost a race for funds");
                let reason = err.to_string();
                self.fire(id, Event::Fail, move |op| op.status_explanation = Some(reason))?;
                self.get_operation(id)
            }
            Err(err) => Err(err),
        }
    }

    /// Start releasing a balance lock; completes when every asset is returned
    pub fn release_balance_lock(&self, id: Uuid) -> Result<OperationSnapshot> {
        self.advance(id, Event::StartReleasing)
    }

    /// Re-deliver a terminal child's event to its parent
    ///
    /// Safe to repeat; the parent skips an event it no longer accepts.
    pub fn resync(&self, child_id: Uuid) -> Result<Option<Delivery>> {
        let child = self.ctx.store.load(child_id)?;
        let event = sync::parent_event(child.kind(), child.status);
        let (Some(parent), Some(event)) = (child.parent.clone(), event) else {
            return Ok(None);
        };
        self.notify_parent(child_id, &parent, event).map(Some)
    }

    /// Record an explanation on an operation that needs an operator and flag
    /// the ledger entries of the reservation behind it
    pub(crate) fn park(&self, id: Uuid, explanation: String) -> Result<()> {
        let _guard = self.op_locks.lock(&id);

        let mut op = self.ctx.store.load(id)?;
        op.status_explanation = Some(explanation);
        op.touch();

        let mut set = WriteSet::new();
        self.ctx.store.stage(&mut set, &op, false)?;
        let reservation_owner = op.parent_operation().unwrap_or(op.id);
        let marked = self.ctx.ledger.mark_entries_error(reservation_owner, set)?;

        warn!(operation_id = %id, %reservation_owner, entries = marked, "Operation parked");
        Ok(())
    }

    /// Persist a new operation together with its postings
    fn insert(&self, op: Operation, postings: Vec<Posting>) -> Result<OperationSnapshot> {
        let mut set = WriteSet::new();
        self.ctx.store.stage(&mut set, &op, true)?;
        self.ctx.ledger.post_batch(postings, set)?;

        self.ctx.metrics.record_transition(op.kind().as_str(), op.status.as_str());
        info!(
            operation_id = %op.id,
            kind = %op.kind(),
            owner = %op.owner,
            amount = %op.amount,
            fee = %op.fee,
            "Operation created"
        );
        Ok(op.snapshot())
    }

    /// Replay the after-hooks of transitions whose follow-ups did not all
    /// succeed, and return how many were settled
    ///
    /// Follow-ups are idempotent, so replaying one that already ran while its
    /// marker was still set is harmless.
    pub fn settle_pending(&self) -> Result<usize> {
        let mut settled = 0;
        for id in self.ctx.store.unsettled()? {
            let settlement = self.replay_locked(id)?;
            match self.drain(settlement) {
                Ok(()) => settled += 1,
                Err(err) => warn!(operation_id = %id, error = %err, "Follow-ups still unsettled"),
            }
        }
        if settled > 0 {
            info!(settled, "Replayed unsettled follow-ups");
        }
        Ok(settled)
    }

    /// Fire under the operation and child locks, then drain follow-ups
    /// unlocked
    ///
    /// Fails with `FollowUpFailed` when the transition committed but some of
    /// its follow-ups did not run; those stay marked for
    /// [`settle_pending`](Self::settle_pending).
    pub(crate) fn fire(
        &self,
        id: Uuid,
        event: Event,
        prepare: impl FnOnce(&mut Operation),
    ) -> Result<()> {
        match self.fire_locked(id, event, prepare)? {
            Some(settlement) => self.drain(settlement),
            None => Ok(()),
        }
    }

    fn fire_locked(
        &self,
        id: Uuid,
        event: Event,
        prepare: impl FnOnce(&mut Operation),
    ) -> Result<Option<Settlement>> {
        let _guards = self.lock_family(id)?;

        let mut op = self.ctx.store.load(id)?;
        prepare(&mut op);
        let fired = self.graphs.for_kind(op.kind()).fire(event, &mut op, &self.ctx)?;
        Ok(Settlement::after(&mut op, fired))
    }

    /// Fire only if the current state accepts the event
    fn fire_if_accepted(&self, id: Uuid, event: Event) -> Result<Option<Settlement>> {
        let _guards = self.lock_family(id)?;

        let mut op = self.ctx.store.load(id)?;
        let machine = self.graphs.for_kind(op.kind());
        if !machine.may_fire(event, &op, &self.ctx) {
            debug!(operation_id = %id, %event, status = %op.status, "Event not accepted; skipped");
            return Ok(None);
        }
        let fired = machine.fire(event, &mut op, &self.ctx)?;
        Ok(Settlement::after(&mut op, fired))
    }

    fn replay_locked(&self, id: Uuid) -> Result<Settlement> {
        let _guard = self.op_locks.lock(&id);

        let mut op = self.ctx.store.load(id)?;
        let hook_error = self
            .graphs
            .for_kind(op.kind())
            .rerun_after_hook(&mut op, &self.ctx)
            .err();
        Ok(Settlement {
            operation_id: id,
            kind: op.kind(),
            revision: op.revision,
            follow_ups: std::mem::take(&mut op.staged.follow_ups),
            hook_error,
        })
    }

    /// Lock an operation, then its children in id order
    fn lock_family(&self, id: Uuid) -> Result<Vec<KeyGuard<'_, Uuid>>> {
        let mut guards = vec![self.op_locks.lock(&id)];
        let children = self.ctx.store.child_ids(id)?;
        guards.extend(self.op_locks.lock_many(children.iter()));
        Ok(guards)
    }

    fn notify_parent(&self, child: Uuid, parent: &ParentRef, event: Event) -> Result<Delivery> {
        match parent {
            ParentRef::Operation(id) => {
                let handle = OperationParent {
                    orchestrator: self,
                    id: *id,
                };
                sync::deliver(&handle, child, parent, event)
            }
            ParentRef::External { kind, id } => {
                self.sync.notify_external(child, kind, id, event)
            }
        }
    }

    /// Run follow-ups in order, clearing the marker of every transition
    /// whose follow-ups all succeeded
    ///
    /// Failures are logged and counted. The committed transitions that queued
    /// them stand and stay marked.
    fn drain(&self, first: Settlement) -> Result<()> {
        let mut queue = VecDeque::from([first]);
        let mut failure = None;

        while let Some(settlement) = queue.pop_front() {
            let Settlement {
                operation_id,
                kind,
                revision,
                follow_ups,
                hook_error,
            } = settlement;
            let mut reason = hook_error.map(|err| err.to_string());

            for follow_up in follow_ups {
                let result = match &follow_up {
                    FollowUp::NotifyParent {
                        child,
                        parent,
                        event,
                    } => self.notify_parent(*child, parent, *event).map(|_| None),
                    FollowUp::Fire {
                        operation_id,
                        event,
                    } => self.fire_if_accepted(*operation_id, *event),
                };
                match result {
                    Ok(next) => queue.extend(next),
                    Err(err) => {
                        error!(%operation_id, ?follow_up, error = %err, "Follow-up failed");
                        if reason.is_none() {
                            reason = Some(err.to_string());
                        }
                    }
                }
            }

            if reason.is_none() {
                if let Err(err) = self.settle(operation_id, revision) {
                    reason = Some(err.to_string());
                }
            }
            if let Some(reason) = reason {
                self.ctx.metrics.record_follow_up_failure(kind.as_str());
                if failure.is_none() {
                    failure = Some(Error::FollowUpFailed {
                        operation_id,
                        reason,
                    });
                }
            }
        }

        failure.map_or(Ok(()), Err)
    }

    fn settle(&self, id: Uuid, revision: u64) -> Result<()> {
        let _guard = self.op_locks.lock(&id);
        if self.ctx.store.clear_unsettled(id, revision)? {
            debug!(operation_id = %id, revision, "Follow-ups settled");
        }
        Ok(())
    }
}

/// Follow-ups of one committed transition and the revision its marker carries
#[derive(Debug)]
struct Settlement {
    operation_id: Uuid,
    kind: OperationKind,
    revision: u64,
    follow_ups: Vec<FollowUp>,
    hook_error: Option<Error>,
}

impl Settlement {
    /// `None` when the transition had no after-hook and left no marker
    fn after(op: &mut Operation, fired: Fired<Status>) -> Option<Self> {
        if !fired.after_hook {
            return None;
        }
        Some(Self {
            operation_id: op.id,
            kind: op.kind(),
            revision: op.revision,
            follow_ups: std::mem::take(&mut op.staged.follow_ups),
            hook_error: fired.after_hook_error,
        })
    }
}

/// [`ParentHandle`] over an operation of this engine
struct OperationParent<'a> {
    orchestrator: &'a TransferOrchestrator,
    id: Uuid,
}

impl ParentHandle for OperationParent<'_> {
    fn may_fire(&self, event: Event) -> bool {
        match self.orchestrator.ctx.store.load(self.id) {
            Ok(op) => self
                .orchestrator
                .graphs
                .for_kind(op.kind())
                .may_fire(event, &op, &self.orchestrator.ctx),
            Err(err) => {
                warn!(operation_id = %self.id, error = %err, "Cannot load parent operation");
                false
            }
        }
    }

    fn fire(&self, event: Event) -> Result<()> {
        self.orchestrator.fire(self.id, event, |_| {})
    }
}
