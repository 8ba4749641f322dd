//! Services shared by every transition hook
//!
//! [`EngineContext`] is the `C` of every operation state machine. Its
//! `commit` turns a fired transition into one ledger write batch: staged
//! postings, the operation row, staged children, rewritten existing children,
//! their outbox records and, when an after-hook follows, the operation's
//! unsettled marker.

use crate::{
    interfaces::{AssetRegistry, DepositVerifier},
    machine::TransitionContext,
    metrics::EngineMetrics,
    operation::Operation,
    store::OperationStore,
    Error, Result,
};
use ledger_core::{AccountKey, AssetCode, Ledger, OwnerId, Posting, ReleaseMode, WriteSet};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Hook context
pub struct EngineContext {
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) store: OperationStore,
    pub(crate) registry: Arc<dyn AssetRegistry>,
    pub(crate) verifier: Arc<dyn DepositVerifier>,
    pub(crate) fee_collector: Option<OwnerId>,
    pub(crate) max_relay_attempts: u32,
    pub(crate) metrics: EngineMetrics,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("fee_collector", &self.fee_collector)
            .field("max_relay_attempts", &self.max_relay_attempts)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Credit posting moving `fee` to the fee collector, if any fee is due
    pub(crate) fn fee_postings(
        &self,
        asset: &AssetCode,
        fee: Decimal,
        operation_id: Uuid,
    ) -> Result<Vec<Posting>> {
        if fee.is_zero() {
            return Ok(Vec::new());
        }
        let collector = self
            .fee_collector
            .clone()
            .ok_or_else(|| Error::Config("fee charged but no fee_collector configured".into()))?;
        let account = AccountKey {
            owner: collector,
            asset: asset.clone(),
        };
        Ok(vec![Posting::credit(account, fee, operation_id)])
    }

    /// Return every reservation the operation still holds
    pub(crate) fn release_postings(&self, operation_id: Uuid) -> Result<Vec<Posting>> {
        Ok(self
            .ledger
            .outstanding_reservations(operation_id)?
            .into_iter()
            .map(|(account, amount)| {
                Posting::release(account, amount, ReleaseMode::Return, operation_id)
            })
            .collect())
    }
}

impl TransitionContext<Operation> for EngineContext {
    fn commit(&self, op: &mut Operation, after_hook: bool) -> Result<()> {
        op.touch();
        let postings = std::mem::take(&mut op.staged.postings);
        let children = std::mem::take(&mut op.staged.children);
        let updated = std::mem::take(&mut op.staged.updated);

        let mut set = WriteSet::new();
        self.store.stage(&mut set, op, false)?;
        if after_hook {
            self.store.stage_unsettled(&mut set, op);
        }
        for child in &children {
            self.store.stage(&mut set, child, true)?;
        }
        for other in &updated {
            self.store.stage(&mut set, other, false)?;
        }

        self.ledger.post_batch(postings, set)?;

        self.metrics.record_transition(op.kind().as_str(), op.status.as_str());
        for child in &children {
            self.metrics.record_transition(child.kind().as_str(), child.status.as_str());
            tracing::info!(
                operation_id = %child.id,
                parent_id = %op.id,
                kind = %child.kind(),
                "Child operation created"
            );
        }
        for other in &updated {
            self.metrics.record_transition(other.kind().as_str(), other.status.as_str());
            tracing::info!(
                operation_id = %other.id,
                parent_id = %op.id,
                status = %other.status,
                "Child operation closed with parent"
            );
        }
        Ok(())
    }
}
