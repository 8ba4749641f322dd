//! Seams to external collaborators
//!
//! The engine consumes an asset registry, a settlement gateway, an event
//! publisher, a parent-entity lookup and a deposit verifier. Defaults are
//! provided for the registry (from config), the publisher (tracing), the
//! lookup (no external parents) and the verifier (accept all).

use crate::{
    config::AssetConfig,
    operation::{Event, Operation, OperationKind},
    Result,
};
use async_trait::async_trait;
use ledger_core::{AssetCode, OwnerId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Owner/asset registry
pub trait AssetRegistry: Send + Sync {
    /// Whether new operations may use `asset`
    fn is_asset_supported(&self, asset: &AssetCode) -> bool;

    /// Fee charged for `kind` on `asset`
    fn fee_for(&self, asset: &AssetCode, kind: OperationKind) -> Decimal;
}

/// Registry backed by the `assets` config section
#[derive(Debug, Clone, Default)]
pub struct StaticAssetRegistry {
    assets: HashMap<AssetCode, AssetConfig>,
}

impl StaticAssetRegistry {
    /// Build from asset configs
    pub fn new(assets: &[AssetConfig]) -> Self {
        Self {
            assets: assets
                .iter()
                .map(|a| (AssetCode::new(&a.code), a.clone()))
                .collect(),
        }
    }
}

impl AssetRegistry for StaticAssetRegistry {
    fn is_asset_supported(&self, asset: &AssetCode) -> bool {
        self.assets.get(asset).map_or(false, |a| a.enabled)
    }

    fn fee_for(&self, asset: &AssetCode, kind: OperationKind) -> Decimal {
        self.assets
            .get(asset)
            .and_then(|a| a.fees.get(kind.as_str()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

/// Pluggable verification predicate for deposits
pub trait DepositVerifier: Send + Sync {
    /// Whether the deposit may be credited
    fn verify(&self, deposit: &Operation) -> bool;
}

/// Verifier that accepts every deposit
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllDeposits;

impl DepositVerifier for AcceptAllDeposits {
    fn verify(&self, _deposit: &Operation) -> bool {
        true
    }
}

/// What the external system is asked to execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPayload {
    /// Relay operation id (also the idempotency key)
    pub operation_id: Uuid,
    /// Parent withdrawal
    pub withdrawal_id: Option<Uuid>,
    /// Owner
    pub owner: OwnerId,
    /// Asset
    pub asset: AssetCode,
    /// Amount paid out
    pub amount: Decimal,
    /// Payout destination
    pub destination: String,
}

/// Answer to `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// External system took the request
    Accepted,
    /// External system refused the request
    Rejected,
    /// No definitive answer
    Unknown,
}

/// Answer to `query_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStatus {
    /// Still being executed
    Pending,
    /// Executed
    Succeeded,
    /// Definitively not executed
    Failed,
    /// External system has no record of the key
    Unknown,
}

/// External settlement/exchange engine
///
/// `submit` must be idempotent for a repeated key.
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Submit the action under `idempotency_key`
    async fn submit(&self, idempotency_key: Uuid, payload: &RelayPayload) -> Result<SubmitOutcome>;

    /// Authoritative status for `idempotency_key`
    async fn query_status(&self, idempotency_key: Uuid) -> Result<ExternalStatus>;
}

/// Outbound event sink
///
/// Delivery is at-least-once; consumers dedupe on `event_id`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event
    async fn publish(&self, event_id: Uuid, topic: &str, payload: &str) -> Result<()>;
}

/// Publisher that writes events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event_id: Uuid, topic: &str, payload: &str) -> Result<()> {
        tracing::info!(%event_id, topic, payload, "Event published");
        Ok(())
    }
}

/// Handle to a parent entity's state machine
pub trait ParentHandle: Send {
    /// Whether the parent's current state accepts `event`
    fn may_fire(&self, event: Event) -> bool;

    /// Fire `event` on the parent
    fn fire(&self, event: Event) -> Result<()>;
}

/// Resolves parents that live outside this engine
pub trait ParentLookup: Send + Sync {
    /// Handle for the external entity, if it exists
    fn find_parent(&self, kind: &str, id: &str) -> Option<Box<dyn ParentHandle>>;
}

/// Lookup that knows no external parents
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExternalParents;

impl ParentLookup for NoExternalParents {
    fn find_parent(&self, _kind: &str, _id: &str) -> Option<Box<dyn ParentHandle>> {
        None
    }
}
