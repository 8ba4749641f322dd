//! Outbox dispatcher
//!
//! Every committed transition leaves an outbox record in the same write batch.
//! The dispatcher is a single task that drains those records in creation
//! order through the [`EventPublisher`], deleting each one only after it was
//! published. A crash between publish and delete republishes the record on
//! restart; consumers dedupe on `event_id`.
//!
//! ```text
//! OutboxHandle (Clone) --mpsc--> OutboxDispatcher --publish--> EventPublisher
//!                                     |
//!                                     +-- tick every flush_interval
//! ```

use crate::{
    config::OutboxConfig, interfaces::EventPublisher, metrics::EngineMetrics,
    store::OperationStore, Error, Result,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration};

/// Message sent to the dispatcher
pub enum OutboxMessage {
    /// New records were committed; drain soon
    Notify,

    /// Drain now and report how many records were delivered
    Flush {
        /// Reply channel
        response: oneshot::Sender<Result<usize>>,
    },

    /// Drain once more, then stop
    Shutdown {
        /// Reply channel
        response: oneshot::Sender<Result<usize>>,
    },
}

impl fmt::Debug for OutboxMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxMessage::Notify => f.write_str("Notify"),
            OutboxMessage::Flush { .. } => f.write_str("Flush"),
            OutboxMessage::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

/// Task that publishes outbox records
pub struct OutboxDispatcher {
    store: OperationStore,
    publisher: Arc<dyn EventPublisher>,
    metrics: EngineMetrics,
    mailbox: mpsc::Receiver<OutboxMessage>,
    max_batch_size: usize,
    flush_interval: Duration,
}

impl fmt::Debug for OutboxDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboxDispatcher")
            .field("max_batch_size", &self.max_batch_size)
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}

impl OutboxDispatcher {
    /// Create new dispatcher
    pub fn new(
        store: OperationStore,
        publisher: Arc<dyn EventPublisher>,
        metrics: EngineMetrics,
        mailbox: mpsc::Receiver<OutboxMessage>,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            metrics,
            mailbox,
            max_batch_size: config.max_batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
        }
    }

    /// Run the dispatcher loop
    pub async fn run(mut self) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(OutboxMessage::Notify) => {
                            if let Err(e) = self.drain().await {
                                tracing::error!(error = %e, "Outbox drain failed");
                            }
                        }
                        Some(OutboxMessage::Flush { response }) => {
                            let _ = response.send(self.drain().await);
                        }
                        Some(OutboxMessage::Shutdown { response }) => {
                            let _ = response.send(self.drain().await);
                            break;
                        }
                        // Every handle dropped
                        None => {
                            let _ = self.drain().await;
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        tracing::error!(error = %e, "Outbox drain on tick failed");
                    }
                }
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }

    /// Publish pending records until the outbox is empty or a publish fails
    ///
    /// Stops at the first failure so records stay in creation order.
    async fn drain(&mut self) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let records = self.store.pending_events(self.max_batch_size)?;
            if records.is_empty() {
                break;
            }
            let batch_len = records.len();

            for record in records {
                self.publisher
                    .publish(record.event_id, &record.topic, &record.payload)
                    .await
                    .map_err(|e| {
                        tracing::warn!(
                            event_id = %record.event_id,
                            topic = %record.topic,
                            error = %e,
                            "Publish failed; record kept"
                        );
                        e
                    })?;
                self.store.ack_event(record.event_id)?;
                self.metrics.outbox_published_total.inc();
                delivered += 1;
            }

            if batch_len < self.max_batch_size {
                break;
            }
        }

        if delivered > 0 {
            tracing::debug!(delivered, "Outbox flushed");
        }
        Ok(delivered)
    }
}

/// Handle for sending messages to the dispatcher
#[derive(Debug, Clone)]
pub struct OutboxHandle {
    sender: mpsc::Sender<OutboxMessage>,
}

impl OutboxHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<OutboxMessage>) -> Self {
        Self { sender }
    }

    /// Wake the dispatcher without waiting
    pub fn notify(&self) {
        // A full mailbox already holds a pending wake-up
        let _ = self.sender.try_send(OutboxMessage::Notify);
    }

    /// Drain now; returns the number of records delivered
    pub async fn flush(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OutboxMessage::Flush { response: tx })
            .await
            .map_err(|_| Error::External("outbox dispatcher stopped".to_string()))?;

        rx.await
            .map_err(|_| Error::External("outbox response channel closed".to_string()))?
    }

    /// Drain once more and stop the dispatcher
    pub async fn shutdown(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OutboxMessage::Shutdown { response: tx })
            .await
            .map_err(|_| Error::External("outbox dispatcher stopped".to_string()))?;

        rx.await
            .map_err(|_| Error::External("outbox response channel closed".to_string()))?
    }
}

/// Spawn the outbox dispatcher
pub fn spawn_outbox_dispatcher(
    store: OperationStore,
    publisher: Arc<dyn EventPublisher>,
    metrics: EngineMetrics,
    config: &OutboxConfig,
) -> OutboxHandle {
    let (tx, rx) = mpsc::channel(64);
    let dispatcher = OutboxDispatcher::new(store, publisher, metrics, rx, config);

    tokio::spawn(async move {
        dispatcher.run().await;
    });

    OutboxHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, OperationSnapshot, Payload};
    use async_trait::async_trait;
    use ledger_core::{AssetCode, Ledger, OwnerId, WriteSet};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recording {
        published: Mutex<Vec<(Uuid, String, String)>>,
        down: AtomicBool,
    }

    #[async_trait]
    impl EventPublisher for Recording {
        async fn publish(&self, event_id: Uuid, topic: &str, payload: &str) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::External("broker down".into()));
            }
            let record = (event_id, topic.to_string(), payload.to_string());
            self.published.lock().push(record);
            Ok(())
        }
    }

    fn open_ledger(dir: &TempDir) -> Arc<Ledger> {
        let config = ledger_core::Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        Arc::new(Ledger::open(&config).unwrap())
    }

    fn commit_deposit(store: &OperationStore, ledger_store: &Ledger) -> Uuid {
        let op = Operation::new(
            OwnerId::new("alice"),
            Some(AssetCode::new("BTC")),
            dec!(1),
            Payload::Deposit { txid: None },
        );
        let mut set = WriteSet::new();
        store.stage(&mut set, &op, true).unwrap();
        ledger_store.commit_records(set).unwrap();
        op.id
    }

    fn config() -> OutboxConfig {
        OutboxConfig {
            max_batch_size: 2,
            flush_interval_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_flush_publishes_in_order_and_acks() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let store = OperationStore::new(ledger.clone());
        let operations: Vec<Uuid> = (0..3).map(|_| commit_deposit(&store, &ledger)).collect();
        let created: Vec<Uuid> = store
            .pending_events(10)
            .unwrap()
            .iter()
            .map(|record| record.event_id)
            .collect();
        assert_eq!(created.len(), 3);

        let publisher = Arc::new(Recording::default());
        let metrics = EngineMetrics::new().unwrap();
        let handle = spawn_outbox_dispatcher(store.clone(), publisher.clone(), metrics, &config());

        let delivered = handle.flush().await.unwrap();
        // The first tick may already have drained some records
        assert!(delivered <= 3);

        // Batches of two still publish strictly in creation order, once each
        let published = publisher.published.lock().clone();
        let ids: Vec<Uuid> = published.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, created);
        let announced: Vec<Uuid> = published
            .iter()
            .map(|(_, _, payload)| {
                serde_json::from_str::<OperationSnapshot>(payload)
                    .unwrap()
                    .id
            })
            .collect();
        assert_eq!(announced, operations);
        assert!(published
            .iter()
            .all(|(_, topic, _)| topic == "operation.deposit.pending"));
        assert!(store.pending_events(10).unwrap().is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_outage_then_recovery() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let store = OperationStore::new(ledger.clone());
        commit_deposit(&store, &ledger);

        let publisher = Arc::new(Recording::default());
        publisher.down.store(true, Ordering::SeqCst);
        let metrics = EngineMetrics::new().unwrap();
        let handle = spawn_outbox_dispatcher(store.clone(), publisher.clone(), metrics, &config());

        assert!(handle.flush().await.is_err());
        assert_eq!(store.pending_events(10).unwrap().len(), 1);

        publisher.down.store(false, Ordering::SeqCst);
        assert_eq!(handle.flush().await.unwrap(), 1);
        assert!(store.pending_events(10).unwrap().is_empty());
        assert_eq!(handle.shutdown().await.unwrap(), 0);
    }
}
