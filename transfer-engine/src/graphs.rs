//! State graphs of the concrete operation kinds
//!
//! Unlisted edges are illegal. Ledger effects and the closing of open
//! children are staged by before-hooks and committed with the status write.
//! After-hooks only queue follow-ups, and they read nothing but persisted
//! state so a crash before the follow-ups ran can replay them.

use crate::{
    context::EngineContext,
    machine::{StateMachine, Stateful, Transition},
    operation::{Event, FollowUp, LockAction, Operation, OperationKind, ParentRef, Payload, Status},
    sync, Error, Result,
};
use chrono::Utc;
use ledger_core::{AccountKey, Posting};
use rust_decimal::Decimal;
use uuid::Uuid;

/// State machine over operations
pub type OperationMachine = StateMachine<Operation, EngineContext>;

type OpTransition = Transition<Operation, EngineContext>;

impl Stateful for Operation {
    type State = Status;
    type Event = Event;

    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> Status {
        self.status
    }

    fn set_state(&mut self, state: Status) {
        self.status = state;
    }
}

/// One machine per kind
#[derive(Debug)]
pub struct Graphs {
    deposit: OperationMachine,
    withdrawal: OperationMachine,
    withdrawal_relay: OperationMachine,
    internal_transfer: OperationMachine,
    escrow_freeze: OperationMachine,
    escrow_unfreeze: OperationMachine,
    balance_lock: OperationMachine,
    balance_lock_operation: OperationMachine,
}

impl Default for Graphs {
    fn default() -> Self {
        Self::new()
    }
}

impl Graphs {
    /// Build every graph
    pub fn new() -> Self {
        Self {
            deposit: deposit(),
            withdrawal: withdrawal(),
            withdrawal_relay: withdrawal_relay(),
            internal_transfer: internal_transfer(),
            escrow_freeze: escrow_freeze(),
            escrow_unfreeze: escrow_unfreeze(),
            balance_lock: balance_lock(),
            balance_lock_operation: balance_lock_operation(),
        }
    }

    /// Machine driving `kind`
    pub fn for_kind(&self, kind: OperationKind) -> &OperationMachine {
        match kind {
            OperationKind::Deposit => &self.deposit,
            OperationKind::Withdrawal => &self.withdrawal,
            OperationKind::WithdrawalRelay => &self.withdrawal_relay,
            OperationKind::InternalTransfer => &self.internal_transfer,
            OperationKind::EscrowFreeze => &self.escrow_freeze,
            OperationKind::EscrowUnfreeze => &self.escrow_unfreeze,
            OperationKind::BalanceLock => &self.balance_lock,
            OperationKind::BalanceLockOperation => &self.balance_lock_operation,
        }
    }
}

fn deposit() -> OperationMachine {
    use Status::*;
    StateMachine::new("deposit", Pending)
        .terminal([Verified, Forged, Cancelled])
        .transition(
            OpTransition::new(Event::Verify, [Pending, Rejected], Verified)
                .guard("deposit_verifier", |op, ctx| ctx.verifier.verify(op))
                .before(credit_deposit),
        )
        .transition(OpTransition::new(Event::Forge, [Pending], Forged))
        .transition(OpTransition::new(Event::Reject, [Pending], Rejected))
        .transition(OpTransition::new(Event::Cancel, [Pending, Rejected], Cancelled))
}

fn withdrawal() -> OperationMachine {
    use Status::*;
    StateMachine::new("withdrawal", Pending)
        .terminal([Completed, Failed, Cancelled])
        .transition(OpTransition::new(Event::Process, [Pending], Processing).before(stage_relay))
        .transition(
            OpTransition::new(Event::Complete, [Processing], Completed)
                .before(settle_reservation)
                .after(propagate),
        )
        .transition(
            OpTransition::new(Event::Fail, [Processing], Failed)
                .guard("relay_not_in_flight", relay_not_in_flight)
                .before(release_and_close)
                .after(propagate),
        )
        .transition(
            OpTransition::new(Event::Cancel, [Pending, Processing], Cancelled)
                .guard("relay_not_in_flight", relay_not_in_flight)
                .before(release_and_close)
                .after(propagate),
        )
}

fn withdrawal_relay() -> OperationMachine {
    use Status::*;
    StateMachine::new("withdrawal_relay", Pending)
        .terminal([Processed, Abandoned, Cancelled])
        .transition(
            OpTransition::new(
                Event::StartRelaying,
                [Pending, RelayFailed, RelayCrashed],
                Relaying,
            )
            .guard("parent_processing", parent_processing)
            .guard("attempt_budget", |op, ctx| {
                op.relay_attempts() < ctx.max_relay_attempts
            })
            .before(count_attempt),
        )
        .transition(
            OpTransition::new(Event::Relay, [Relaying, RelayCrashed], Processed).after(propagate),
        )
        .transition(OpTransition::new(
            Event::Fail,
            [Relaying, RelayCrashed],
            RelayFailed,
        ))
        .transition(OpTransition::new(Event::Crash, [Relaying], RelayCrashed))
        .transition(
            OpTransition::new(Event::Abandon, [RelayFailed, RelayCrashed], Abandoned)
                .after(propagate),
        )
        .transition(OpTransition::new(Event::Cancel, [Pending], Cancelled).after(propagate))
}

fn internal_transfer() -> OperationMachine {
    use Status::*;
    StateMachine::new("internal_transfer", Pending)
        .terminal([Completed, Failed, Cancelled])
        .transition(
            OpTransition::new(Event::Complete, [Pending], Completed)
                .before(settle_to_counterparty),
        )
        .transition(OpTransition::new(Event::Fail, [Pending], Failed).before(release_reservation))
        .transition(
            OpTransition::new(Event::Cancel, [Pending], Cancelled).before(release_reservation),
        )
}

fn escrow_freeze() -> OperationMachine {
    use Status::*;
    StateMachine::new("escrow_freeze", Pending)
        .terminal([Released, Claimed, Cancelled])
        .transition(OpTransition::new(Event::Activate, [Pending], Active))
        .transition(OpTransition::new(Event::Release, [Active], Released).before(release_and_close))
        .transition(OpTransition::new(Event::Claim, [Active], Claimed).before(settle_and_close))
        .transition(
            OpTransition::new(Event::Cancel, [Pending, Active], Cancelled)
                .before(release_and_close),
        )
}

fn escrow_unfreeze() -> OperationMachine {
    use Status::*;
    StateMachine::new("escrow_unfreeze", Pending)
        .terminal([Completed, Failed, Cancelled])
        .transition(OpTransition::new(Event::Process, [Pending], Processing))
        .transition(
            OpTransition::new(Event::Complete, [Processing], Completed).after(propagate),
        )
        .transition(OpTransition::new(Event::Fail, [Pending, Processing], Failed))
        .transition(OpTransition::new(Event::Cancel, [Pending, Processing], Cancelled))
}

fn balance_lock() -> OperationMachine {
    use Status::*;
    StateMachine::new("balance_lock", Pending)
        .terminal([Released, Failed, Cancelled])
        .transition(
            OpTransition::new(Event::Lock, [Pending], Locked)
                .before(reserve_snapshot)
                .after(reconcile_lock_children),
        )
        .transition(OpTransition::new(Event::Fail, [Pending], Failed).before(close_open_children))
        .transition(
            OpTransition::new(Event::StartReleasing, [Locked], Releasing)
                .before(|op, _| stage_lock_children(op, LockAction::Release))
                .after(reconcile_lock_children),
        )
        .transition(
            OpTransition::new(Event::Release, [Releasing], Released)
                .before(release_reservation)
                .after(reconcile_lock_children),
        )
        .transition(
            OpTransition::new(Event::Cancel, [Pending, Locked, Releasing], Cancelled)
                .before(release_and_close),
        )
}

fn balance_lock_operation() -> OperationMachine {
    use Status::*;
    StateMachine::new("balance_lock_operation", Pending)
        .terminal([Completed, Failed])
        .transition(OpTransition::new(Event::Process, [Pending], Processing))
        .transition(OpTransition::new(Event::Complete, [Processing], Completed))
        .transition(OpTransition::new(Event::Fail, [Pending, Processing], Failed))
}

/// Terminal status an open child takes when its parent closes first
///
/// Every entry is an edge of the child's own graph that carries no hooks.
/// Children in flight elsewhere (`relaying`, `relay_crashed`) have no entry;
/// the parent's guards keep it from closing over them.
pub fn closing_status(kind: OperationKind, status: Status) -> Option<Status> {
    use OperationKind as K;
    use Status as S;
    match (kind, status) {
        (K::WithdrawalRelay, S::Pending) => Some(S::Cancelled),
        (K::WithdrawalRelay, S::RelayFailed) => Some(S::Abandoned),
        (K::EscrowUnfreeze, S::Pending | S::Processing) => Some(S::Cancelled),
        (K::BalanceLockOperation, S::Pending | S::Processing) => Some(S::Failed),
        _ => None,
    }
}

// Guards

fn relay_not_in_flight(op: &Operation, ctx: &EngineContext) -> bool {
    match ctx.store.children(op.id) {
        Ok(children) => !children.iter().any(|child| {
            matches!(
                child.status,
                Status::Relaying | Status::RelayCrashed | Status::Processed
            )
        }),
        Err(err) => {
            tracing::warn!(operation_id = %op.id, error = %err, "Cannot load relay children");
            false
        }
    }
}

fn parent_processing(op: &Operation, ctx: &EngineContext) -> bool {
    let Some(parent) = op.parent_operation() else {
        return false;
    };
    match ctx.store.load(parent) {
        Ok(parent) => parent.status == Status::Processing,
        Err(err) => {
            tracing::warn!(operation_id = %op.id, error = %err, "Cannot load relay parent");
            false
        }
    }
}

// Before-hooks

fn owner_account(op: &Operation) -> Result<AccountKey> {
    op.account()
        .ok_or_else(|| Error::Hook(format!("operation {} has no asset", op.id)))
}

fn credit_deposit(op: &mut Operation, ctx: &EngineContext) -> Result<()> {
    let account = owner_account(op)?;
    let net = op.amount - op.fee;
    if net > Decimal::ZERO {
        op.staged.postings.push(Posting::credit(account.clone(), net, op.id));
    }
    let fees = ctx.fee_postings(&account.asset, op.fee, op.id)?;
    op.staged.postings.extend(fees);
    Ok(())
}

fn stage_relay(op: &mut Operation, _ctx: &EngineContext) -> Result<()> {
    let destination = match &op.payload {
        Payload::Withdrawal { destination } => destination.clone(),
        _ => return Err(Error::Hook(format!("operation {} is not a withdrawal", op.id))),
    };
    let mut relay = Operation::new(
        op.owner.clone(),
        op.asset.clone(),
        op.amount,
        Payload::WithdrawalRelay {
            destination,
            attempts: 0,
            last_attempt_at: None,
        },
    );
    relay.parent = Some(ParentRef::Operation(op.id));
    relay.metadata = op.metadata.clone();
    op.staged.children.push(relay);
    Ok(())
}

fn settle_reservation(op: &mut Operation, ctx: &EngineContext) -> Result<()> {
    let account = owner_account(op)?;
    op.staged.postings.push(Posting::settle(account.clone(), op.reserved_total(), op.id));
    let fees = ctx.fee_postings(&account.asset, op.fee, op.id)?;
    op.staged.postings.extend(fees);
    Ok(())
}

fn settle_to_counterparty(op: &mut Operation, ctx: &EngineContext) -> Result<()> {
    let account = owner_account(op)?;
    let receiver = match &op.payload {
        Payload::InternalTransfer { receiver } => receiver.clone(),
        Payload::EscrowFreeze { beneficiary } => beneficiary.clone(),
        _ => return Err(Error::Hook(format!("operation {} has no counterparty", op.id))),
    };
    op.staged.postings.push(Posting::settle(account.clone(), op.reserved_total(), op.id));
    let counterparty = AccountKey {
        owner: receiver,
        asset: account.asset.clone(),
    };
    op.staged.postings.push(Posting::credit(counterparty, op.amount, op.id));
    let fees = ctx.fee_postings(&account.asset, op.fee, op.id)?;
    op.staged.postings.extend(fees);
    Ok(())
}

fn release_reservation(op: &mut Operation, ctx: &EngineContext) -> Result<()> {
    let releases = ctx.release_postings(op.id)?;
    op.staged.postings.extend(releases);
    Ok(())
}

fn release_and_close(op: &mut Operation, ctx: &EngineContext) -> Result<()> {
    release_reservation(op, ctx)?;
    close_open_children(op, ctx)
}

fn settle_and_close(op: &mut Operation, ctx: &EngineContext) -> Result<()> {
    settle_to_counterparty(op, ctx)?;
    close_open_children(op, ctx)
}

/// Stage every open child in its closing status, written with the parent
///
/// Callers hold the locks of the parent and all of its children.
fn close_open_children(op: &mut Operation, ctx: &EngineContext) -> Result<()> {
    for mut child in ctx.store.children(op.id)? {
        let Some(status) = closing_status(child.kind(), child.status) else {
            continue;
        };
        child.status = status;
        child.status_explanation = Some("closed with parent".to_string());
        child.touch();
        op.staged.updated.push(child);
    }
    Ok(())
}

fn count_attempt(op: &mut Operation, _ctx: &EngineContext) -> Result<()> {
    if let Payload::WithdrawalRelay {
        attempts,
        last_attempt_at,
        ..
    } = &mut op.payload
    {
        *attempts += 1;
        *last_attempt_at = Some(Utc::now());
    }
    Ok(())
}

fn reserve_snapshot(op: &mut Operation, _ctx: &EngineContext) -> Result<()> {
    let amounts = match &op.payload {
        Payload::BalanceLock { amounts } => amounts.clone(),
        _ => return Err(Error::Hook(format!("operation {} is not a balance lock", op.id))),
    };
    for (asset, amount) in &amounts {
        let account = AccountKey {
            owner: op.owner.clone(),
            asset: asset.clone(),
        };
        op.staged.postings.push(Posting::reserve(account, *amount, op.id));
    }
    stage_lock_children(op, LockAction::Lock)
}

fn stage_lock_children(op: &mut Operation, action: LockAction) -> Result<()> {
    let amounts = match &op.payload {
        Payload::BalanceLock { amounts } => amounts.clone(),
        _ => return Err(Error::Hook(format!("operation {} is not a balance lock", op.id))),
    };
    for (asset, amount) in amounts {
        let mut child = Operation::new(
            op.owner.clone(),
            Some(asset),
            amount,
            Payload::BalanceLockOperation { action },
        );
        child.parent = Some(ParentRef::Operation(op.id));
        op.staged.children.push(child);
    }
    Ok(())
}

// After-hooks

fn propagate(op: &mut Operation, _ctx: &EngineContext) -> Result<()> {
    let event = sync::parent_event(op.kind(), op.status);
    if let (Some(parent), Some(event)) = (op.parent.clone(), event) {
        op.staged.follow_ups.push(FollowUp::NotifyParent {
            child: op.id,
            parent,
            event,
        });
    }
    Ok(())
}

/// Queue the child events that bring the lock records in line with the
/// parent's status
///
/// Lock records finish once the parent is locked. Release records start
/// processing on `releasing` and finish on `released`. While releasing, the
/// parent's own `release` is queued after its children.
fn reconcile_lock_children(op: &mut Operation, ctx: &EngineContext) -> Result<()> {
    for child in ctx.store.children(op.id)? {
        let Payload::BalanceLockOperation { action } = &child.payload else {
            continue;
        };
        let finish = *action == LockAction::Lock || op.status == Status::Released;
        let events: &[Event] = match (child.status, finish) {
            (Status::Pending, true) => &[Event::Process, Event::Complete],
            (Status::Pending, false) => &[Event::Process],
            (Status::Processing, true) => &[Event::Complete],
            _ => &[],
        };
        for event in events {
            op.staged.follow_ups.push(FollowUp::Fire {
                operation_id: child.id,
                event: *event,
            });
        }
    }
    if op.status == Status::Releasing {
        op.staged.follow_ups.push(FollowUp::Fire {
            operation_id: op.id,
            event: Event::Release,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use Event as E;
    use OperationKind as K;
    use Status as S;

    /// Every legal (kind, status, event) edge, ignoring guards
    #[rustfmt::skip]
    const EDGES: &[(K, S, E, S)] = &[
        (K::Deposit,              S::Pending,      E::Verify,         S::Verified),
        (K::Deposit,              S::Rejected,     E::Verify,         S::Verified),
        (K::Deposit,              S::Pending,      E::Forge,          S::Forged),
        (K::Deposit,              S::Pending,      E::Reject,         S::Rejected),
        (K::Deposit,              S::Pending,      E::Cancel,         S::Cancelled),
        (K::Deposit,              S::Rejected,     E::Cancel,         S::Cancelled),
        (K::Withdrawal,           S::Pending,      E::Process,        S::Processing),
        (K::Withdrawal,           S::Processing,   E::Complete,       S::Completed),
        (K::Withdrawal,           S::Processing,   E::Fail,           S::Failed),
        (K::Withdrawal,           S::Pending,      E::Cancel,         S::Cancelled),
        (K::Withdrawal,           S::Processing,   E::Cancel,         S::Cancelled),
        (K::WithdrawalRelay,      S::Pending,      E::StartRelaying,  S::Relaying),
        (K::WithdrawalRelay,      S::RelayFailed,  E::StartRelaying,  S::Relaying),
        (K::WithdrawalRelay,      S::RelayCrashed, E::StartRelaying,  S::Relaying),
        (K::WithdrawalRelay,      S::Relaying,     E::Relay,          S::Processed),
        (K::WithdrawalRelay,      S::RelayCrashed, E::Relay,          S::Processed),
        (K::WithdrawalRelay,      S::Relaying,     E::Fail,           S::RelayFailed),
        (K::WithdrawalRelay,      S::RelayCrashed, E::Fail,           S::RelayFailed),
        (K::WithdrawalRelay,      S::Relaying,     E::Crash,          S::RelayCrashed),
        (K::WithdrawalRelay,      S::RelayFailed,  E::Abandon,        S::Abandoned),
        (K::WithdrawalRelay,      S::RelayCrashed, E::Abandon,        S::Abandoned),
        (K::WithdrawalRelay,      S::Pending,      E::Cancel,         S::Cancelled),
        (K::InternalTransfer,     S::Pending,      E::Complete,       S::Completed),
        (K::InternalTransfer,     S::Pending,      E::Fail,           S::Failed),
        (K::InternalTransfer,     S::Pending,      E::Cancel,         S::Cancelled),
        (K::EscrowFreeze,         S::Pending,      E::Activate,       S::Active),
        (K::EscrowFreeze,         S::Active,       E::Release,        S::Released),
        (K::EscrowFreeze,         S::Active,       E::Claim,          S::Claimed),
        (K::EscrowFreeze,         S::Pending,      E::Cancel,         S::Cancelled),
        (K::EscrowFreeze,         S::Active,       E::Cancel,         S::Cancelled),
        (K::EscrowUnfreeze,       S::Pending,      E::Process,        S::Processing),
        (K::EscrowUnfreeze,       S::Processing,   E::Complete,       S::Completed),
        (K::EscrowUnfreeze,       S::Pending,      E::Fail,           S::Failed),
        (K::EscrowUnfreeze,       S::Processing,   E::Fail,           S::Failed),
        (K::EscrowUnfreeze,       S::Pending,      E::Cancel,         S::Cancelled),
        (K::EscrowUnfreeze,       S::Processing,   E::Cancel,         S::Cancelled),
        (K::BalanceLock,          S::Pending,      E::Lock,           S::Locked),
        (K::BalanceLock,          S::Pending,      E::Fail,           S::Failed),
        (K::BalanceLock,          S::Locked,       E::StartReleasing, S::Releasing),
        (K::BalanceLock,          S::Releasing,    E::Release,        S::Released),
        (K::BalanceLock,          S::Pending,      E::Cancel,         S::Cancelled),
        (K::BalanceLock,          S::Locked,       E::Cancel,         S::Cancelled),
        (K::BalanceLock,          S::Releasing,    E::Cancel,         S::Cancelled),
        (K::BalanceLockOperation, S::Pending,      E::Process,        S::Processing),
        (K::BalanceLockOperation, S::Processing,   E::Complete,       S::Completed),
        (K::BalanceLockOperation, S::Pending,      E::Fail,           S::Failed),
        (K::BalanceLockOperation, S::Processing,   E::Fail,           S::Failed),
    ];

    #[test]
    fn test_graphs_match_edge_table_exhaustively() {
        let graphs = Graphs::new();
        for kind in OperationKind::ALL {
            let machine = graphs.for_kind(kind);
            for status in Status::ALL {
                for event in Event::ALL {
                    let expected = EDGES
                        .iter()
                        .find(|(k, s, e, _)| *k == kind && *s == status && *e == event)
                        .map(|(_, _, _, to)| *to);
                    assert_eq!(
                        machine.target(status, event),
                        expected,
                        "{} {} {}",
                        kind,
                        status,
                        event
                    );
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let graphs = Graphs::new();
        for kind in OperationKind::ALL {
            let machine = graphs.for_kind(kind);
            assert_eq!(machine.initial(), Status::Pending);
            for status in Status::ALL {
                if machine.is_terminal(status) {
                    assert!(
                        machine.events_from(status).is_empty(),
                        "{} {}",
                        kind,
                        status
                    );
                }
            }
        }
    }

    #[test]
    fn test_closing_statuses_are_legal_edges() {
        let graphs = Graphs::new();
        for kind in OperationKind::ALL {
            let machine = graphs.for_kind(kind);
            for status in Status::ALL {
                let Some(closed) = closing_status(kind, status) else {
                    continue;
                };
                assert!(machine.is_terminal(closed), "{} {}", kind, closed);
                assert!(
                    Event::ALL
                        .iter()
                        .any(|event| machine.target(status, *event) == Some(closed)),
                    "{} cannot reach {} from {}",
                    kind,
                    closed,
                    status
                );
            }
        }
    }

    #[test]
    fn test_children_close_unless_in_flight() {
        let relay = OperationKind::WithdrawalRelay;
        assert_eq!(
            closing_status(relay, Status::Pending),
            Some(Status::Cancelled)
        );
        assert_eq!(
            closing_status(relay, Status::RelayFailed),
            Some(Status::Abandoned)
        );
        assert_eq!(closing_status(relay, Status::Relaying), None);
        assert_eq!(closing_status(relay, Status::RelayCrashed), None);
        assert_eq!(closing_status(relay, Status::Processed), None);

        let graphs = Graphs::new();
        for kind in [OperationKind::EscrowUnfreeze, OperationKind::BalanceLockOperation] {
            let machine = graphs.for_kind(kind);
            for status in Status::ALL {
                let open = !machine.is_terminal(status) && !machine.events_from(status).is_empty();
                assert_eq!(
                    closing_status(kind, status).is_some(),
                    open,
                    "{} {}",
                    kind,
                    status
                );
            }
        }
    }

    #[test]
    fn test_each_state_has_at_most_one_after_hook() {
        let graphs = Graphs::new();
        for kind in OperationKind::ALL {
            for status in Status::ALL {
                assert!(
                    graphs.for_kind(kind).hooked_entries(status) <= 1,
                    "{} {}",
                    kind,
                    status
                );
            }
        }
    }

    #[test]
    fn test_machine_names_match_kinds() {
        let graphs = Graphs::new();
        for kind in OperationKind::ALL {
            assert_eq!(graphs.for_kind(kind).name(), kind.as_str());
        }
    }
}
