//! Engine wiring
//!
//! Opens the ledger, builds the orchestrator and relay recovery, and starts
//! the background tasks.

use crate::{
    config::Config,
    interfaces::{EventPublisher, SettlementGateway},
    orchestrator::{Collaborators, TransferOrchestrator},
    outbox::{spawn_outbox_dispatcher, OutboxHandle},
    relay::{RelayRecovery, SweepReport},
    Result,
};
use ledger_core::Ledger;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Fully wired transfer engine
#[derive(Debug)]
pub struct TransferEngine {
    orchestrator: Arc<TransferOrchestrator>,
    relay: Arc<RelayRecovery>,
    outbox: OutboxHandle,
    config: Config,
}

impl TransferEngine {
    /// Open storage, recover in-flight relays and start the outbox dispatcher
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn start(
        config: Config,
        collaborators: Collaborators,
        gateway: Arc<dyn SettlementGateway>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<(Self, SweepReport)> {
        config.validate()?;
        tracing::info!(
            service = %config.service_name,
            data_dir = ?config.ledger.data_dir,
            "Starting transfer engine"
        );

        let ledger = Arc::new(Ledger::open(&config.ledger)?);
        let orchestrator = Arc::new(TransferOrchestrator::new(ledger, &config, collaborators)?);
        let relay = Arc::new(RelayRecovery::new(
            orchestrator.clone(),
            gateway,
            config.relay.clone(),
        ));

        let outbox = spawn_outbox_dispatcher(
            orchestrator.store().clone(),
            publisher,
            orchestrator.metrics().clone(),
            &config.outbox,
        );

        let report = relay.recover_on_startup().await?;
        outbox.notify();

        let engine = Self {
            orchestrator,
            relay,
            outbox,
            config,
        };
        Ok((engine, report))
    }

    /// Spawn the periodic relay sweep
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let relay = self.relay.clone();
        tokio::spawn(async move {
            relay.run().await;
        })
    }

    /// Orchestrator
    pub fn orchestrator(&self) -> &Arc<TransferOrchestrator> {
        &self.orchestrator
    }

    /// Relay recovery
    pub fn relay(&self) -> &Arc<RelayRecovery> {
        &self.relay
    }

    /// Outbox dispatcher handle
    pub fn outbox(&self) -> &OutboxHandle {
        &self.outbox
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flush the outbox and stop the dispatcher
    pub async fn shutdown(&self) -> Result<()> {
        let delivered = self.outbox.shutdown().await?;
        tracing::info!(delivered, "Transfer engine stopped");
        Ok(())
    }
}
