//! Relay recovery
//!
//! Wraps the withdrawal payout step. `begin` persists `relaying` before any
//! external call; that row is the recovery anchor. An ambiguous outcome parks
//! the relay in `relay_crashed` and the sweep asks the external system for
//! the idempotency key's status before it ever resubmits.
//!
//! The idempotency key is the relay operation id on every call. A relay is
//! only started while its withdrawal is `processing`; a relay whose
//! withdrawal already ended is closed by the sweep instead of paid out.
//! Relays parked for an operator leave the sweep until resolved.

use crate::{
    config::RelayConfig,
    interfaces::{ExternalStatus, RelayPayload, SettlementGateway, SubmitOutcome},
    operation::{Event, Operation, OperationKind, OperationSnapshot, Payload, Status},
    orchestrator::TransferOrchestrator,
    Error, Result,
};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use crate::operation::MANUAL_INTERVENTION;

/// Result of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// External system executed the payout
    Relayed,
    /// External system definitively did not execute it
    Failed,
    /// Outcome unknown; left for the sweep
    Crashed,
}

impl RelayOutcome {
    /// `Ok(true)` relayed, `Ok(false)` failed, `RelayAmbiguous` when crashed
    pub fn into_result(self, operation_id: Uuid) -> Result<bool> {
        match self {
            RelayOutcome::Relayed => Ok(true),
            RelayOutcome::Failed => Ok(false),
            RelayOutcome::Crashed => Err(Error::RelayAmbiguous(operation_id)),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Relayed => "relayed",
            RelayOutcome::Failed => "failed",
            RelayOutcome::Crashed => "crashed",
        }
    }
}

/// What one sweep pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Relays that reached `processed`
    pub relayed: usize,
    /// Relays that reached `relay_failed`
    pub failed: usize,
    /// Resubmissions made
    pub retried: usize,
    /// Relays whose outcome is still unknown
    pub ambiguous: usize,
    /// Relays closed because their withdrawal had already ended
    pub closed: usize,
    /// Relays parked on this pass, past their attempt budget
    pub manual_intervention: Vec<Uuid>,
    /// Transitions whose replayed follow-ups settled
    pub settled: usize,
}

impl SweepReport {
    fn tally(&mut self, outcome: RelayOutcome) {
        match outcome {
            RelayOutcome::Relayed => self.relayed += 1,
            RelayOutcome::Failed => self.failed += 1,
            RelayOutcome::Crashed => self.ambiguous += 1,
        }
    }
}

/// Exactly-once-effective relay step plus its recovery sweep
pub struct RelayRecovery {
    orchestrator: Arc<TransferOrchestrator>,
    gateway: Arc<dyn SettlementGateway>,
    config: RelayConfig,
}

impl fmt::Debug for RelayRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayRecovery")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RelayRecovery {
    /// Create recovery over an orchestrator and a gateway
    pub fn new(
        orchestrator: Arc<TransferOrchestrator>,
        gateway: Arc<dyn SettlementGateway>,
        config: RelayConfig,
    ) -> Self {
        Self {
            orchestrator,
            gateway,
            config,
        }
    }

    /// Move the withdrawal to `processing` and run its relay once
    pub async fn process_withdrawal(&self, withdrawal_id: Uuid) -> Result<RelayOutcome> {
        self.orchestrator.advance(withdrawal_id, Event::Process)?;
        let relay = self
            .orchestrator
            .store()
            .children(withdrawal_id)?
            .into_iter()
            .find(|child| child.kind() == OperationKind::WithdrawalRelay)
            .ok_or_else(|| Error::Hook(format!("withdrawal {} has no relay", withdrawal_id)))?;
        self.execute(relay.id).await
    }

    /// `begin` then `attempt`
    pub async fn execute(&self, id: Uuid) -> Result<RelayOutcome> {
        self.begin(id)?;
        self.attempt(id).await
    }

    /// Persist `relaying` before the external call
    pub fn begin(&self, id: Uuid) -> Result<()> {
        let op = self.load_relay(id)?;
        if op.status == Status::Relaying {
            return Err(Error::AlreadyInFlight(id));
        }

        match self.orchestrator.fire(id, Event::StartRelaying, |_| {}) {
            Ok(()) => {
                let attempt = op.relay_attempts() + 1;
                debug!(operation_id = %id, attempt, "Relay marked in flight");
                Ok(())
            }
            Err(Error::GuardRejected {
                guard: "attempt_budget",
                ..
            }) => {
                let attempts = op.relay_attempts();
                if !op.needs_manual_intervention() {
                    let reason = format!("relay attempt budget of {} exhausted", attempts);
                    self.park(&op, &reason)?;
                }
                Err(Error::PermanentFailure {
                    operation_id: id,
                    attempts,
                })
            }
            Err(err @ Error::InvalidTransition { .. }) => {
                if self.orchestrator.store().load(id)?.status == Status::Relaying {
                    Err(Error::AlreadyInFlight(id))
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Perform or re-verify the external call for a relay
    ///
    /// Terminal relays report their outcome without side effects, so a repeat
    /// call is a no-op.
    pub async fn attempt(&self, id: Uuid) -> Result<RelayOutcome> {
        let op = self.load_relay(id)?;
        match op.status {
            Status::Processed => Ok(RelayOutcome::Relayed),
            Status::RelayFailed | Status::Abandoned | Status::Cancelled => Ok(RelayOutcome::Failed),
            Status::RelayCrashed => match self.query(&op).await {
                Some(ExternalStatus::Succeeded) => self.conclude(id, Event::Relay, None),
                Some(ExternalStatus::Failed) => {
                    let explanation = "settlement gateway reports failure".to_string();
                    self.conclude(id, Event::Fail, Some(explanation))
                }
                _ => Ok(RelayOutcome::Crashed),
            },
            Status::Relaying => self.submit(&op).await,
            status => Err(Error::InvalidTransition {
                kind: "withdrawal_relay",
                status: status.to_string(),
                event: "attempt".to_string(),
            }),
        }
    }

    /// Operator resolution of a relay that needs manual intervention
    pub fn resolve(&self, id: Uuid, status: ExternalStatus) -> Result<RelayOutcome> {
        self.load_relay(id)?;
        let event = match status {
            ExternalStatus::Succeeded => Event::Relay,
            ExternalStatus::Failed => Event::Abandon,
            other => {
                return Err(Error::Validation(format!(
                    "resolution must be succeeded or failed, got {:?}",
                    other
                )))
            }
        };
        let explanation = format!("resolved manually as {:?}", status);
        self.orchestrator
            .fire(id, event, |op| op.status_explanation = Some(explanation))?;
        info!(operation_id = %id, ?status, "Relay resolved manually");
        self.outcome_of(id)
    }

    /// Relays waiting for [`resolve`](Self::resolve)
    pub fn parked(&self) -> Result<Vec<OperationSnapshot>> {
        Ok(self
            .orchestrator
            .store()
            .parked()?
            .iter()
            .map(Operation::snapshot)
            .collect())
    }

    /// Settle pending follow-ups, then visit relays that are not terminal
    ///
    /// `stale` is how long a `relaying` row may go without progress before it
    /// is presumed crashed; `None` presumes all of them crashed. Rows still
    /// fresh are skipped before the batch is cut, so they never crowd out
    /// work that is due.
    pub async fn sweep(&self, stale: Option<Duration>) -> Result<SweepReport> {
        let mut report = SweepReport {
            settled: self.orchestrator.settle_pending()?,
            ..Default::default()
        };

        let due: Vec<Operation> = self
            .orchestrator
            .store()
            .relay_watch()?
            .into_iter()
            .filter(|op| op.status != Status::Relaying || is_stale(op, stale))
            .collect();
        if due.is_empty() {
            debug!("No relays to sweep");
            return Ok(report);
        }

        for op in due.into_iter().take(self.config.batch_size) {
            if let Err(err) = self.sweep_one(&op, stale, &mut report).await {
                match err {
                    Error::PermanentFailure { operation_id, .. } => {
                        report.manual_intervention.push(operation_id)
                    }
                    Error::AlreadyInFlight(_) => {
                        debug!(operation_id = %op.id, "Relay in flight elsewhere")
                    }
                    other => error!(operation_id = %op.id, error = %other, "Relay sweep failed"),
                }
            }
        }

        info!(
            relayed = report.relayed,
            failed = report.failed,
            retried = report.retried,
            ambiguous = report.ambiguous,
            closed = report.closed,
            manual = report.manual_intervention.len(),
            settled = report.settled,
            "Relay sweep complete"
        );
        Ok(report)
    }

    /// One sweep with no staleness threshold, for process start
    pub async fn recover_on_startup(&self) -> Result<SweepReport> {
        info!("Recovering relays after restart");
        self.sweep(None).await
    }

    /// Sweep forever
    pub async fn run(&self) -> ! {
        info!(
            sweep_interval_secs = self.config.sweep_interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            "Starting relay recovery"
        );

        loop {
            if let Err(e) = self.sweep(Some(self.config.stale_after())).await {
                error!(error = %e, "Relay sweep failed");
            }

            tokio::time::sleep(self.config.sweep_interval()).await;
        }
    }

    async fn sweep_one(
        &self,
        op: &Operation,
        stale: Option<Duration>,
        report: &mut SweepReport,
    ) -> Result<()> {
        if matches!(op.status, Status::Pending | Status::RelayFailed) && !self.parent_active(op)? {
            self.close_orphan(op)?;
            report.closed += 1;
            return Ok(());
        }

        match op.status {
            Status::Pending => {
                let outcome = self.execute(op.id).await?;
                report.tally(outcome);
            }
            Status::Relaying => {
                if !is_stale(op, stale) {
                    return Ok(());
                }
                warn!(operation_id = %op.id, "Relay presumed crashed");
                self.orchestrator.fire(op.id, Event::Crash, |op| {
                    op.status_explanation = Some("relay presumed crashed".into())
                })?;
                let reloaded = self.load_relay(op.id)?;
                self.recover_crashed(&reloaded, report).await?;
            }
            Status::RelayCrashed => self.recover_crashed(op, report).await?,
            Status::RelayFailed => {
                if op.relay_attempts() >= self.config.max_attempts {
                    if !op.needs_manual_intervention() {
                        let reason = format!("relay failed after {} attempts", op.relay_attempts());
                        self.park(op, &reason)?;
                    }
                    report.manual_intervention.push(op.id);
                    return Ok(());
                }
                report.retried += 1;
                let outcome = self.execute(op.id).await?;
                report.tally(outcome);
            }
            _ => {}
        }
        Ok(())
    }

    async fn recover_crashed(&self, op: &Operation, report: &mut SweepReport) -> Result<()> {
        match self.query(op).await {
            Some(ExternalStatus::Succeeded) => {
                report.tally(self.conclude(op.id, Event::Relay, None)?)
            }
            Some(ExternalStatus::Failed) => report.tally(self.conclude(
                op.id,
                Event::Fail,
                Some("settlement gateway reports failure".into()),
            )?),
            Some(ExternalStatus::Unknown) => {
                debug!(operation_id = %op.id, "External system never saw the relay; resubmitting");
                report.retried += 1;
                let outcome = self.execute(op.id).await?;
                report.tally(outcome);
            }
            Some(ExternalStatus::Pending) | None => report.ambiguous += 1,
        }
        Ok(())
    }

    async fn submit(&self, op: &Operation) -> Result<RelayOutcome> {
        let payload = relay_payload(op)?;
        let submitted = self.gateway.submit(op.id, &payload);
        let result = tokio::time::timeout(self.config.submit_timeout(), submitted).await;

        match result {
            Ok(Ok(SubmitOutcome::Accepted)) => self.conclude(op.id, Event::Relay, None),
            Ok(Ok(SubmitOutcome::Rejected)) => {
                let explanation = "rejected by settlement gateway".to_string();
                self.conclude(op.id, Event::Fail, Some(explanation))
            }
            Ok(Ok(SubmitOutcome::Unknown)) => {
                self.crash(op.id, "settlement gateway returned no outcome")
            }
            Ok(Err(e)) => self.crash(op.id, &format!("submit failed: {}", e)),
            Err(_) => self.crash(
                op.id,
                &format!("submit timed out after {}ms", self.config.submit_timeout_ms),
            ),
        }
    }

    async fn query(&self, op: &Operation) -> Option<ExternalStatus> {
        let queried = self.gateway.query_status(op.id);
        match tokio::time::timeout(self.config.submit_timeout(), queried).await {
            Ok(Ok(status)) => {
                debug!(operation_id = %op.id, ?status, "Relay status queried");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(operation_id = %op.id, error = %e, "Relay status query failed");
                None
            }
            Err(_) => {
                warn!(operation_id = %op.id, "Relay status query timed out");
                None
            }
        }
    }

    fn crash(&self, id: Uuid, reason: &str) -> Result<RelayOutcome> {
        warn!(operation_id = %id, reason, "Relay outcome ambiguous");
        self.conclude(id, Event::Crash, Some(reason.to_string()))
    }

    /// Fire the outcome event; a lost race reports whatever state won
    fn conclude(
        &self,
        id: Uuid,
        event: Event,
        explanation: Option<String>,
    ) -> Result<RelayOutcome> {
        let fired = self.orchestrator.fire(id, event, |op| {
            if explanation.is_some() {
                op.status_explanation = explanation;
            }
        });
        match fired {
            Ok(()) | Err(Error::InvalidTransition { .. }) => {}
            Err(err @ Error::FollowUpFailed { .. }) => {
                warn!(
                    operation_id = %id,
                    error = %err,
                    "Relay concluded; follow-ups left for the next sweep"
                );
            }
            Err(err) => return Err(err),
        }
        let outcome = self.outcome_of(id)?;
        self.orchestrator.metrics().record_relay_outcome(outcome.as_str());
        Ok(outcome)
    }

    fn outcome_of(&self, id: Uuid) -> Result<RelayOutcome> {
        Ok(match self.orchestrator.store().load(id)?.status {
            Status::Processed => RelayOutcome::Relayed,
            Status::RelayFailed | Status::Abandoned | Status::Cancelled => RelayOutcome::Failed,
            _ => RelayOutcome::Crashed,
        })
    }

    /// Whether the relay's withdrawal still waits on it
    fn parent_active(&self, op: &Operation) -> Result<bool> {
        match op.parent_operation() {
            Some(parent) => {
                let parent = self.orchestrator.store().load(parent)?;
                Ok(parent.status == Status::Processing)
            }
            None => Ok(false),
        }
    }

    fn close_orphan(&self, op: &Operation) -> Result<()> {
        let event = match op.status {
            Status::Pending => Event::Cancel,
            _ => Event::Abandon,
        };
        warn!(
            operation_id = %op.id,
            status = %op.status,
            %event,
            "Closing relay of an ended withdrawal"
        );
        let closed = self.orchestrator.fire(op.id, event, |op| {
            op.status_explanation = Some("withdrawal already ended".to_string())
        });
        match closed {
            Ok(()) | Err(Error::FollowUpFailed { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn park(&self, op: &Operation, reason: &str) -> Result<()> {
        let explanation = format!("{}: {}", MANUAL_INTERVENTION, reason);
        error!(
            operation_id = %op.id,
            attempts = op.relay_attempts(),
            reason,
            "Relay needs manual intervention"
        );
        self.orchestrator.park(op.id, explanation)
    }

    fn load_relay(&self, id: Uuid) -> Result<Operation> {
        let op = self.orchestrator.store().load(id)?;
        if op.kind() != OperationKind::WithdrawalRelay {
            return Err(Error::Validation(format!(
                "operation {} is not a withdrawal relay",
                id
            )));
        }
        Ok(op)
    }
}

fn is_stale(op: &Operation, stale: Option<Duration>) -> bool {
    let Some(stale) = stale else {
        return true;
    };
    let since = match &op.payload {
        Payload::WithdrawalRelay {
            last_attempt_at: Some(at),
            ..
        } => *at,
        _ => op.updated_at,
    };
    let age = Utc::now().signed_duration_since(since);
    age.to_std().map_or(false, |age| age >= stale)
}

fn relay_payload(op: &Operation) -> Result<RelayPayload> {
    let destination = match &op.payload {
        Payload::WithdrawalRelay { destination, .. } => destination.clone(),
        _ => {
            return Err(Error::Validation(format!(
                "operation {} is not a withdrawal relay",
                op.id
            )))
        }
    };
    let asset = op
        .asset
        .clone()
        .ok_or_else(|| Error::Validation(format!("relay {} has no asset", op.id)))?;
    Ok(RelayPayload {
        operation_id: op.id,
        withdrawal_id: op.parent_operation(),
        owner: op.owner.clone(),
        asset,
        amount: op.amount,
        destination,
    })
}
