//! DelTran Transfer Engine
//!
//! Drives deposits, withdrawals, internal transfers, escrows and balance locks
//! from creation to a terminal state on top of [`ledger_core`].
//!
//! # Architecture
//!
//! 1. **State machines**: one generic interpreter ([`machine::StateMachine`])
//!    runs a data-defined graph per operation kind ([`graphs`])
//! 2. **Orchestration**: [`TransferOrchestrator`] validates requests, reserves
//!    funds with the operation row in one write batch and dispatches events
//!    under a per-operation lock
//! 3. **Relay recovery**: [`RelayRecovery`] persists `relaying` before calling
//!    the settlement gateway and re-queries ambiguous outcomes before retrying
//! 4. **Cross-entity sync**: a child's terminal state fires the matching event
//!    on its parent when the parent accepts it ([`sync`])
//! 5. **Outbox**: every transition writes an event record in the same batch;
//!    [`outbox`] publishes them at least once
//!
//! # Example
//!
//! ```no_run
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//! use transfer_engine::{
//!     Collaborators, Config, Event, NewTransfer, TransferKind, TransferOrchestrator,
//! };
//!
//! fn main() -> transfer_engine::Result<()> {
//!     let config = Config::from_file("transfer-engine.toml")?;
//!     let ledger = Arc::new(ledger_core::Ledger::open(&config.ledger)?);
//!     let collaborators = Collaborators::from_config(&config);
//!     let engine = TransferOrchestrator::new(ledger, &config, collaborators)?;
//!
//!     let deposit = engine.create(NewTransfer::new(
//!         TransferKind::Deposit {
//!             txid: Some("0xabc".into()),
//!         },
//!         "alice",
//!         "BTC",
//!         dec!(1.5),
//!     ))?;
//!     engine.advance(deposit.id, Event::Verify)?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod graphs;
pub mod interfaces;
pub mod machine;
pub mod metrics;
pub mod operation;
pub mod orchestrator;
pub mod outbox;
pub mod relay;
pub mod store;
pub mod sync;
pub mod telemetry;

// Re-exports
pub use config::{AssetConfig, Config, LoggingConfig, OutboxConfig, RelayConfig};
pub use engine::TransferEngine;
pub use error::{Error, Result};
pub use interfaces::{
    AcceptAllDeposits, AssetRegistry, DepositVerifier, EventPublisher, ExternalStatus,
    NoExternalParents, ParentHandle, ParentLookup, RelayPayload, SettlementGateway,
    StaticAssetRegistry, SubmitOutcome, TracingPublisher,
};
pub use operation::{Event, Operation, OperationKind, OperationSnapshot, ParentRef, Payload, Status};
pub use orchestrator::{Collaborators, NewTransfer, TransferKind, TransferOrchestrator};
pub use outbox::{spawn_outbox_dispatcher, OutboxHandle};
pub use relay::{RelayOutcome, RelayRecovery, SweepReport};
pub use sync::{CrossEntitySync, Delivery};
