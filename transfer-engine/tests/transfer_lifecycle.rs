//! Lifecycle tests for every transfer kind
//!
//! Each test drives operations through the public orchestrator API and checks
//! balances, statuses and journal entries afterwards.

mod common;

use common::harness;
use ledger_core::{AssetCode, EntryStatus, OwnerId};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use transfer_engine::{
    Collaborators, Config, DepositVerifier, Error, Event, NewTransfer, Operation, OperationKind,
    ParentHandle, ParentLookup, Status, TransferKind, TransferOrchestrator,
};
use uuid::Uuid;

fn withdrawal(owner: &str, asset: &str, amount: Decimal) -> NewTransfer {
    NewTransfer::new(
        TransferKind::Withdrawal {
            destination: "payout-1".into(),
        },
        owner,
        asset,
        amount,
    )
}

fn deposit(asset: &str, amount: Decimal) -> NewTransfer {
    NewTransfer::new(TransferKind::Deposit { txid: None }, "alice", asset, amount)
}

fn escrow(asset: &str, amount: Decimal) -> NewTransfer {
    NewTransfer::new(
        TransferKind::EscrowFreeze {
            beneficiary: OwnerId::new("bob"),
        },
        "alice",
        asset,
        amount,
    )
}

fn internal(asset: &str, amount: Decimal) -> NewTransfer {
    NewTransfer::new(
        TransferKind::InternalTransfer {
            receiver: OwnerId::new("bob"),
        },
        "alice",
        asset,
        amount,
    )
}

#[test]
fn test_cancel_pending_withdrawal_returns_reservation() {
    let h = harness();
    h.fund("alice", "BTC", dec!(100));

    let w = h.orchestrator.create(withdrawal("alice", "BTC", dec!(40))).unwrap();
    let b = h.balances("alice", "BTC");
    assert_eq!((b.balance, b.frozen_balance), (dec!(100), dec!(40)));

    let cancelled = h.orchestrator.cancel(w.id, "customer request").unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);
    let b = h.balances("alice", "BTC");
    assert_eq!((b.balance, b.frozen_balance), (dec!(100), dec!(0)));

    let err = h.orchestrator.cancel(w.id, "again").unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert_eq!(h.balances("alice", "BTC").frozen_balance, dec!(0));
}

#[test]
fn test_illegal_events_mutate_nothing() {
    let h = harness();
    h.fund("alice", "USDT", dec!(100));

    let requests = vec![
        deposit("USDT", dec!(5)),
        withdrawal("alice", "USDT", dec!(5)),
        internal("USDT", dec!(5)),
        escrow("USDT", dec!(5)),
    ];

    for request in requests {
        let op = h.orchestrator.create(request).unwrap();
        let machine = h.orchestrator.graphs().for_kind(op.kind);
        let legal = machine.events_from(op.status);

        for event in Event::ALL.into_iter().filter(|e| !legal.contains(e)) {
            let balances = h.balances("alice", "USDT");
            let entries = || h.orchestrator.ledger().operation_entries(op.id).unwrap();
            let before = entries();

            let err = h.orchestrator.advance(op.id, event).unwrap_err();
            let illegal = matches!(err, Error::InvalidTransition { .. });
            assert!(illegal, "{} {}", op.kind, event);

            assert_eq!(h.balances("alice", "USDT"), balances);
            assert_eq!(entries(), before);
            assert_eq!(h.orchestrator.get_operation(op.id).unwrap(), op);
        }
    }
}

#[test]
fn test_deposit_credits_net_of_fee() {
    let h = harness();

    let request = NewTransfer::new(
        TransferKind::Deposit {
            txid: Some("0xabc".into()),
        },
        "alice",
        "USDT",
        dec!(10),
    );
    let d = h.orchestrator.create(request).unwrap();
    assert_eq!(d.fee, dec!(0.5));
    assert_eq!(h.balances("alice", "USDT").balance, dec!(0));

    let verified = h.orchestrator.advance(d.id, Event::Verify).unwrap();
    assert_eq!(verified.status, Status::Verified);
    assert_eq!(h.balances("alice", "USDT").balance, dec!(9.5));
    assert_eq!(h.balances("treasury", "USDT").balance, dec!(0.5));
}

#[test]
fn test_deposit_smaller_than_fee_rejected() {
    let h = harness();
    let err = h.orchestrator.create(deposit("USDT", dec!(0.5))).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_rejected_deposit_can_still_be_verified() {
    let h = harness();
    let d = h.orchestrator.create(deposit("BTC", dec!(2))).unwrap();
    let advance = |event| h.orchestrator.advance(d.id, event).unwrap().status;

    assert_eq!(advance(Event::Reject), Status::Rejected);
    assert_eq!(h.balances("alice", "BTC").balance, dec!(0));
    assert_eq!(advance(Event::Verify), Status::Verified);
    assert_eq!(h.balances("alice", "BTC").balance, dec!(2));
}

struct RejectLargeDeposits;

impl DepositVerifier for RejectLargeDeposits {
    fn verify(&self, deposit: &Operation) -> bool {
        deposit.amount < dec!(1000)
    }
}

#[test]
fn test_deposit_verifier_guard() {
    let dir = TempDir::new().unwrap();
    let config = common::config(&dir);
    let ledger = Arc::new(ledger_core::Ledger::open(&config.ledger).unwrap());
    let mut collaborators = Collaborators::from_config(&config);
    collaborators.verifier = Arc::new(RejectLargeDeposits);
    let orchestrator = TransferOrchestrator::new(ledger, &config, collaborators).unwrap();

    let d = orchestrator.create(deposit("BTC", dec!(5000))).unwrap();
    let err = orchestrator.advance(d.id, Event::Verify).unwrap_err();
    assert!(matches!(
        err,
        Error::GuardRejected {
            guard: "deposit_verifier",
            ..
        }
    ));
    let pending = orchestrator.get_operation(d.id).unwrap();
    assert_eq!(pending.status, Status::Pending);

    let forged = orchestrator.advance(d.id, Event::Forge).unwrap();
    assert_eq!(forged.status, Status::Forged);
    let balances = orchestrator
        .get_account_balances(&OwnerId::new("alice"), &AssetCode::new("BTC"))
        .unwrap();
    assert_eq!(balances.balance, dec!(0));
}

#[test]
fn test_withdrawal_reserves_amount_plus_fee() {
    let h = harness();
    h.fund("alice", "USDT", dec!(10));

    let err = h.orchestrator.create(withdrawal("alice", "USDT", dec!(10))).unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));
    assert_eq!(h.balances("alice", "USDT").frozen_balance, dec!(0));

    let w = h.orchestrator.create(withdrawal("alice", "USDT", dec!(9))).unwrap();
    assert_eq!(w.fee, dec!(1));
    assert_eq!(h.balances("alice", "USDT").frozen_balance, dec!(10));
}

#[test]
fn test_cancel_processing_withdrawal_closes_pending_relay() {
    let h = harness();
    h.fund("alice", "BTC", dec!(10));

    let w = h.orchestrator.create(withdrawal("alice", "BTC", dec!(4))).unwrap();
    h.orchestrator.advance(w.id, Event::Process).unwrap();
    let relay = h.relay_of(w.id);
    assert_eq!(h.status(relay), Status::Pending);

    let cancelled = h.orchestrator.cancel(w.id, "ops decision").unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);
    assert_eq!(h.status(relay), Status::Cancelled);
    assert_eq!(h.balances("alice", "BTC").frozen_balance, dec!(0));
    assert_eq!(h.balances("alice", "BTC").balance, dec!(10));
}

#[test]
fn test_internal_transfer_cancel_and_fail_release() {
    let h = harness();
    h.fund("alice", "BTC", dec!(10));

    let transfer = |amount| h.orchestrator.create(internal("BTC", amount)).unwrap();

    let t1 = transfer(dec!(3));
    let t2 = transfer(dec!(4));
    assert_eq!(h.balances("alice", "BTC").frozen_balance, dec!(7));

    h.orchestrator.advance(t1.id, Event::Fail).unwrap();
    h.orchestrator.cancel(t2.id, "duplicate").unwrap();

    let b = h.balances("alice", "BTC");
    assert_eq!((b.balance, b.frozen_balance), (dec!(10), dec!(0)));
    assert_eq!(h.balances("bob", "BTC").balance, dec!(0));

    let entries = h.orchestrator.ledger().operation_entries(t1.id).unwrap();
    assert!(entries.iter().any(|e| e.status == EntryStatus::Failed));
}

#[test]
fn test_escrow_claim_pays_beneficiary_and_fee() {
    let h = harness();
    h.fund("alice", "USDT", dec!(50));

    let e = h.orchestrator.create(escrow("USDT", dec!(10))).unwrap();
    assert_eq!(h.balances("alice", "USDT").frozen_balance, dec!(12));

    h.orchestrator.advance(e.id, Event::Activate).unwrap();
    let claimed = h.orchestrator.advance(e.id, Event::Claim).unwrap();
    assert_eq!(claimed.status, Status::Claimed);

    let alice = h.balances("alice", "USDT");
    assert_eq!((alice.balance, alice.frozen_balance), (dec!(38), dec!(0)));
    assert_eq!(h.balances("bob", "USDT").balance, dec!(10));
    assert_eq!(h.balances("treasury", "USDT").balance, dec!(2));
}

#[test]
fn test_escrow_unfreeze_releases_parent() {
    let h = harness();
    h.fund("alice", "BTC", dec!(5));

    let e = h.orchestrator.create(escrow("BTC", dec!(5))).unwrap();

    // Only an active escrow can be unfrozen
    assert!(h.orchestrator.request_unfreeze(e.id, BTreeMap::new()).is_err());
    h.orchestrator.advance(e.id, Event::Activate).unwrap();

    let u = h.orchestrator.request_unfreeze(e.id, BTreeMap::new()).unwrap();
    assert_eq!(u.kind, OperationKind::EscrowUnfreeze);
    assert!(matches!(
        h.orchestrator.request_unfreeze(e.id, BTreeMap::new()),
        Err(Error::Validation(_))
    ));

    h.orchestrator.advance(u.id, Event::Process).unwrap();
    let completed = h.orchestrator.advance(u.id, Event::Complete).unwrap();
    assert_eq!(completed.status, Status::Completed);

    assert_eq!(h.status(e.id), Status::Released);
    let b = h.balances("alice", "BTC");
    assert_eq!((b.balance, b.frozen_balance), (dec!(5), dec!(0)));
    assert_eq!(h.balances("bob", "BTC").balance, dec!(0));
}

#[test]
fn test_balance_lock_freezes_and_releases_wallet() {
    let h = harness();
    h.fund("alice", "BTC", dec!(5));
    h.fund("alice", "USDT", dec!(7));
    h.orchestrator.create(withdrawal("alice", "BTC", dec!(1))).unwrap();

    let lock = h.orchestrator.lock_balances(&OwnerId::new("alice"), BTreeMap::new()).unwrap();
    assert_eq!(lock.status, Status::Locked);
    assert_eq!(lock.amounts.get(&AssetCode::new("BTC")), Some(&dec!(4)));
    assert_eq!(lock.amounts.get(&AssetCode::new("USDT")), Some(&dec!(7)));
    assert_eq!(h.balances("alice", "BTC").available_balance, dec!(0));
    assert_eq!(h.balances("alice", "USDT").available_balance, dec!(0));

    let children = h.orchestrator.children(lock.id).unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.status == Status::Completed));

    let released = h.orchestrator.release_balance_lock(lock.id).unwrap();
    assert_eq!(released.status, Status::Released);
    assert_eq!(h.balances("alice", "BTC").frozen_balance, dec!(1));
    assert_eq!(h.balances("alice", "USDT").frozen_balance, dec!(0));

    let children = h.orchestrator.children(lock.id).unwrap();
    assert_eq!(children.len(), 4);
    assert!(children.iter().all(|c| c.status == Status::Completed));
}

#[test]
fn test_balance_lock_cancel_releases_everything() {
    let h = harness();
    h.fund("alice", "BTC", dec!(5));

    let lock = h.orchestrator.lock_balances(&OwnerId::new("alice"), BTreeMap::new()).unwrap();
    let cancelled = h.orchestrator.cancel(lock.id, "compliance cleared").unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);
    assert_eq!(h.balances("alice", "BTC").frozen_balance, dec!(0));
}

#[test]
fn test_listing_by_owner() {
    let h = harness();
    h.fund("alice", "BTC", dec!(5));
    let w = h.orchestrator.create(withdrawal("alice", "BTC", dec!(1))).unwrap();
    let d = h.orchestrator.create(deposit("BTC", dec!(1))).unwrap();

    let mut ids: Vec<Uuid> = h
        .orchestrator
        .operations_for_owner(&OwnerId::new("alice"))
        .unwrap()
        .into_iter()
        .map(|op| op.id)
        .collect();
    ids.sort();
    let mut expected = vec![w.id, d.id];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(h.orchestrator.operations_for_owner(&OwnerId::new("bob")).unwrap().is_empty());

    let balances = h.orchestrator.balances_for_owner(&OwnerId::new("alice")).unwrap();
    assert_eq!(balances.len(), 1);
}

#[derive(Clone)]
struct Trade {
    status: Arc<Mutex<Status>>,
    events: Arc<Mutex<Vec<Event>>>,
    offline: Arc<AtomicBool>,
}

impl Trade {
    fn pending() -> Self {
        Self {
            status: Arc::new(Mutex::new(Status::Pending)),
            events: Arc::default(),
            offline: Arc::default(),
        }
    }
}

impl ParentHandle for Trade {
    fn may_fire(&self, event: Event) -> bool {
        *self.status.lock() == Status::Pending
            && matches!(event, Event::Complete | Event::Fail | Event::Cancel)
    }

    fn fire(&self, event: Event) -> transfer_engine::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::External("trade service unavailable".into()));
        }
        *self.status.lock() = Status::Completed;
        self.events.lock().push(event);
        Ok(())
    }
}

struct Trades(Trade);

impl ParentLookup for Trades {
    fn find_parent(&self, kind: &str, id: &str) -> Option<Box<dyn ParentHandle>> {
        if kind == "trade" && id == "t-1" {
            Some(Box::new(self.0.clone()))
        } else {
            None
        }
    }
}

fn with_trade(config: &Config, trade: &Trade) -> TransferOrchestrator {
    let ledger = Arc::new(ledger_core::Ledger::open(&config.ledger).unwrap());
    let mut collaborators = Collaborators::from_config(config);
    collaborators.parent_lookup = Arc::new(Trades(trade.clone()));
    TransferOrchestrator::new(ledger, config, collaborators).unwrap()
}

fn fund_alice(orchestrator: &TransferOrchestrator, amount: Decimal) {
    let alice = ledger_core::AccountKey::new("alice", "BTC");
    orchestrator
        .ledger()
        .credit(&alice, amount, Uuid::now_v7())
        .unwrap();
}

#[test]
fn test_withdrawal_cancel_notifies_external_parent_once() {
    let dir = TempDir::new().unwrap();
    let config = common::config(&dir);
    let trade = Trade::pending();
    let orchestrator = with_trade(&config, &trade);
    fund_alice(&orchestrator, dec!(3));

    let w = orchestrator
        .create(withdrawal("alice", "BTC", dec!(2)).with_parent("trade", "t-1"))
        .unwrap();
    orchestrator.cancel(w.id, "trade expired").unwrap();

    assert_eq!(*trade.events.lock(), vec![Event::Cancel]);
    assert_eq!(*trade.status.lock(), Status::Completed);
    assert!(orchestrator.store().unsettled().unwrap().is_empty());

    // Re-delivery is skipped by the parent's own state check
    orchestrator.resync(w.id).unwrap();
    assert_eq!(trade.events.lock().len(), 1);
}

#[test]
fn test_unreachable_parent_is_reported_and_settled_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = common::config(&dir);
    let trade = Trade::pending();
    trade.offline.store(true, Ordering::SeqCst);

    let withdrawal_id = {
        let orchestrator = with_trade(&config, &trade);
        fund_alice(&orchestrator, dec!(3));
        let w = orchestrator
            .create(withdrawal("alice", "BTC", dec!(2)).with_parent("trade", "t-1"))
            .unwrap();

        // The cancel commits; the caller still learns the parent missed it
        let err = orchestrator.cancel(w.id, "trade expired").unwrap_err();
        assert!(matches!(
            err,
            Error::FollowUpFailed { operation_id, .. } if operation_id == w.id
        ));
        assert_eq!(err.code(), "FOLLOW_UP_FAILED");
        let cancelled = orchestrator.get_operation(w.id).unwrap();
        assert_eq!(cancelled.status, Status::Cancelled);
        assert_eq!(orchestrator.store().unsettled().unwrap(), vec![w.id]);

        // Still down: the marker survives another attempt
        assert_eq!(orchestrator.settle_pending().unwrap(), 0);
        assert_eq!(orchestrator.store().unsettled().unwrap(), vec![w.id]);
        w.id
    };
    assert!(trade.events.lock().is_empty());

    trade.offline.store(false, Ordering::SeqCst);
    let orchestrator = with_trade(&config, &trade);
    assert_eq!(orchestrator.settle_pending().unwrap(), 1);

    assert_eq!(*trade.events.lock(), vec![Event::Cancel]);
    assert!(orchestrator.store().unsettled().unwrap().is_empty());
    assert_eq!(orchestrator.settle_pending().unwrap(), 0);
    assert_eq!(trade.events.lock().len(), 1);

    let b = orchestrator
        .get_account_balances(&OwnerId::new("alice"), &AssetCode::new("BTC"))
        .unwrap();
    assert_eq!((b.balance, b.frozen_balance), (dec!(3), Decimal::ZERO));
    assert_eq!(
        orchestrator.get_operation(withdrawal_id).unwrap().status,
        Status::Cancelled
    );
}
