//! Shared fixtures for transfer-engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ledger_core::{AccountBalances, AccountKey, AssetCode, EntryKind, OwnerId};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use transfer_engine::{
    AssetConfig, Collaborators, Config, ExternalStatus, OperationKind, RelayPayload, RelayRecovery,
    Result, SettlementGateway, Status, SubmitOutcome, TransferOrchestrator,
};
use uuid::Uuid;

/// Settlement gateway with scripted answers and call counters
pub struct MockGateway {
    submit_outcome: Mutex<Option<SubmitOutcome>>,
    query_outcome: Mutex<ExternalStatus>,
    submits: Mutex<HashMap<Uuid, usize>>,
    submit_count: AtomicUsize,
    query_count: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            submit_outcome: Mutex::new(Some(SubmitOutcome::Accepted)),
            query_outcome: Mutex::new(ExternalStatus::Unknown),
            submits: Mutex::new(HashMap::new()),
            submit_count: AtomicUsize::new(0),
            query_count: AtomicUsize::new(0),
        }
    }

    /// `None` makes `submit` return an error
    pub fn set_submit(&self, outcome: Option<SubmitOutcome>) {
        *self.submit_outcome.lock() = outcome;
    }

    pub fn set_query(&self, status: ExternalStatus) {
        *self.query_outcome.lock() = status;
    }

    pub fn submit_count(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    pub fn submits_for(&self, key: Uuid) -> usize {
        self.submits.lock().get(&key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SettlementGateway for MockGateway {
    async fn submit(
        &self,
        idempotency_key: Uuid,
        _payload: &RelayPayload,
    ) -> Result<SubmitOutcome> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        *self.submits.lock().entry(idempotency_key).or_insert(0) += 1;
        let outcome = *self.submit_outcome.lock();
        outcome.ok_or_else(|| transfer_engine::Error::External("connection reset".into()))
    }

    async fn query_status(&self, _idempotency_key: Uuid) -> Result<ExternalStatus> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        Ok(*self.query_outcome.lock())
    }
}

/// Orchestrator and relay recovery over a throwaway ledger
pub struct Harness {
    pub orchestrator: Arc<TransferOrchestrator>,
    pub relay: RelayRecovery,
    pub gateway: Arc<MockGateway>,
    pub config: Config,
    _dir: TempDir,
}

pub fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.ledger.data_dir = dir.path().to_path_buf();
    config.assets = vec![
        AssetConfig::new("BTC"),
        AssetConfig::new("USDT")
            .with_fee(OperationKind::Withdrawal, dec!(1))
            .with_fee(OperationKind::Deposit, dec!(0.5))
            .with_fee(OperationKind::EscrowFreeze, dec!(2)),
    ];
    config.fee_collector = Some("treasury".into());
    config.relay.max_attempts = 3;
    config.relay.submit_timeout_ms = 500;
    config
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    tweak(&mut config);

    let orchestrator = open(&config);
    let gateway = Arc::new(MockGateway::new());
    let relay = RelayRecovery::new(orchestrator.clone(), gateway.clone(), config.relay.clone());

    Harness {
        orchestrator,
        relay,
        gateway,
        config,
        _dir: dir,
    }
}

/// Orchestrator over the ledger in `config`, with default collaborators
pub fn open(config: &Config) -> Arc<TransferOrchestrator> {
    let ledger = Arc::new(ledger_core::Ledger::open(&config.ledger).unwrap());
    let collaborators = Collaborators::from_config(config);
    Arc::new(TransferOrchestrator::new(ledger, config, collaborators).unwrap())
}

impl Harness {
    pub fn fund(&self, owner: &str, asset: &str, amount: Decimal) {
        self.orchestrator
            .ledger()
            .credit(&AccountKey::new(owner, asset), amount, Uuid::now_v7())
            .unwrap();
    }

    pub fn balances(&self, owner: &str, asset: &str) -> AccountBalances {
        self.orchestrator
            .get_account_balances(&OwnerId::new(owner), &AssetCode::new(asset))
            .unwrap()
    }

    pub fn status(&self, id: Uuid) -> Status {
        self.orchestrator.get_operation(id).unwrap().status
    }

    /// Settlement entries (posts consuming frozen funds) of an operation
    pub fn settle_count(&self, operation_id: Uuid) -> usize {
        self.orchestrator
            .ledger()
            .operation_entries(operation_id)
            .unwrap()
            .iter()
            .filter(|e| e.kind == EntryKind::Post && e.frozen_delta < Decimal::ZERO)
            .count()
    }

    /// The relay child of a withdrawal
    pub fn relay_of(&self, withdrawal_id: Uuid) -> Uuid {
        self.orchestrator
            .children(withdrawal_id)
            .unwrap()
            .into_iter()
            .find(|c| c.kind == OperationKind::WithdrawalRelay)
            .expect("withdrawal has a relay child")
            .id
    }
}
