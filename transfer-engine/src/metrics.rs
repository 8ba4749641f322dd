//! Prometheus metrics for the transfer engine
//!
//! # Metrics
//!
//! - `transfer_transitions_total{kind, status}` - Committed transitions by target status
//! - `transfer_relay_outcomes_total{outcome}` - Relay attempt outcomes
//! - `transfer_outbox_published_total` - Outbox records delivered
//! - `transfer_follow_up_failures_total{kind}` - Committed transitions whose follow-ups failed

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct EngineMetrics {
    /// Transitions by kind and target status
    pub transitions_total: IntCounterVec,

    /// Relay outcomes
    pub relay_outcomes_total: IntCounterVec,

    /// Delivered outbox records
    pub outbox_published_total: IntCounter,

    /// Transitions left unsettled by a failed follow-up
    pub follow_up_failures_total: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl EngineMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "transfer_transitions_total",
                "Committed operation transitions",
            ),
            &["kind", "status"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let relay_outcomes_total = IntCounterVec::new(
            Opts::new("transfer_relay_outcomes_total", "Relay attempt outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(relay_outcomes_total.clone()))?;

        let outbox_published_total = IntCounter::new(
            "transfer_outbox_published_total",
            "Outbox records delivered to the publisher",
        )?;
        registry.register(Box::new(outbox_published_total.clone()))?;

        let follow_up_failures_total = IntCounterVec::new(
            Opts::new(
                "transfer_follow_up_failures_total",
                "Committed transitions whose follow-ups failed",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(follow_up_failures_total.clone()))?;

        Ok(Self {
            transitions_total,
            relay_outcomes_total,
            outbox_published_total,
            follow_up_failures_total,
            registry,
        })
    }

    /// Record a committed transition
    pub fn record_transition(&self, kind: &str, status: &str) {
        self.transitions_total.with_label_values(&[kind, status]).inc();
    }

    /// Record a relay outcome
    pub fn record_relay_outcome(&self, outcome: &str) {
        self.relay_outcomes_total.with_label_values(&[outcome]).inc();
    }

    /// Record a transition whose follow-ups failed
    pub fn record_follow_up_failure(&self, kind: &str) {
        self.follow_up_failures_total.with_label_values(&[kind]).inc();
    }
}

impl fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}
