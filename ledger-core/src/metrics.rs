//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the ledger. Each [`Metrics`] owns a private
//! registry so several ledgers (and tests) can coexist in one process.
//!
//! # Metrics
//!
//! - `ledger_entries_total{kind}` - Entries written, by entry kind
//! - `ledger_insufficient_funds_total` - Reservations rejected for lack of funds
//! - `ledger_batch_size` - Histogram of postings per committed batch
//! - `ledger_post_duration_seconds` - Histogram of batch posting latencies

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};
use std::fmt;
use std::sync::Arc;

use crate::types::EntryKind;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Entries written, labelled by kind
    pub entries_total: IntCounterVec,

    /// Reservations rejected with insufficient funds
    pub insufficient_funds_total: IntCounter,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Posting duration histogram
    pub post_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total = IntCounterVec::new(
            Opts::new(
                "ledger_entries_total",
                "Total number of ledger entries written",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let insufficient_funds_total = IntCounter::new(
            "ledger_insufficient_funds_total",
            "Reservations rejected for insufficient available balance",
        )?;
        registry.register(Box::new(insufficient_funds_total.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("ledger_batch_size", "Histogram of postings per batch")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let post_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_post_duration_seconds",
                "Histogram of batch posting latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(post_duration.clone()))?;

        Ok(Self {
            entries_total,
            insufficient_funds_total,
            batch_size,
            post_duration,
            registry,
        })
    }

    /// Record one written entry
    pub fn record_entry(&self, kind: EntryKind) {
        self.entries_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Record an insufficient-funds rejection
    pub fn record_insufficient_funds(&self) {
        self.insufficient_funds_total.inc();
    }

    /// Record a committed batch
    pub fn record_batch(&self, postings: usize, duration_seconds: f64) {
        self.batch_size.observe(postings as f64);
        self.post_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
