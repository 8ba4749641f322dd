//! Cross-entity propagation of terminal states
//!
//! A child that reaches a terminal state queues a notification for its
//! parent. Delivery checks `may_fire` first and skips silently when the parent
//! no longer accepts the event; the parent's from-states make a repeated
//! delivery a no-op.

use crate::{
    interfaces::{ParentHandle, ParentLookup},
    operation::{Event, OperationKind, ParentRef, Status},
    Error, Result,
};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Event a parent receives when a child of `kind` reaches `status`
pub fn parent_event(kind: OperationKind, status: Status) -> Option<Event> {
    use OperationKind as K;
    use Status as S;
    match (kind, status) {
        (K::WithdrawalRelay, S::Processed) => Some(Event::Complete),
        (K::WithdrawalRelay, S::Abandoned) => Some(Event::Fail),
        (K::WithdrawalRelay, S::Cancelled) => Some(Event::Cancel),
        (K::Withdrawal, S::Completed) => Some(Event::Complete),
        (K::Withdrawal, S::Failed) => Some(Event::Fail),
        (K::Withdrawal, S::Cancelled) => Some(Event::Cancel),
        (K::EscrowUnfreeze, S::Completed) => Some(Event::Release),
        _ => None,
    }
}

/// Outcome of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Parent transitioned
    Fired,
    /// Parent did not accept the event in its current state
    Skipped,
    /// No parent entity was found
    Unresolved,
}

/// Delivers child terminal events to parent state machines
#[derive(Clone)]
pub struct CrossEntitySync {
    lookup: Arc<dyn ParentLookup>,
}

impl fmt::Debug for CrossEntitySync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossEntitySync").finish_non_exhaustive()
    }
}

impl CrossEntitySync {
    /// Create with the lookup for parents outside this engine
    pub fn new(lookup: Arc<dyn ParentLookup>) -> Self {
        Self { lookup }
    }

    /// Deliver to a parent that lives outside this engine
    pub fn notify_external(
        &self,
        child: Uuid,
        kind: &str,
        id: &str,
        event: Event,
    ) -> Result<Delivery> {
        let parent = ParentRef::External {
            kind: kind.to_string(),
            id: id.to_string(),
        };
        match self.lookup.find_parent(kind, id) {
            Some(handle) => deliver(handle.as_ref(), child, &parent, event),
            None => {
                tracing::warn!(%child, %parent, %event, "Parent entity not found");
                Ok(Delivery::Unresolved)
            }
        }
    }
}

/// Fire `event` on `handle` if it accepts it
///
/// A parent advanced by another path between the check and the fire is
/// treated as skipped.
pub fn deliver(
    handle: &dyn ParentHandle,
    child: Uuid,
    parent: &ParentRef,
    event: Event,
) -> Result<Delivery> {
    if !handle.may_fire(event) {
        tracing::debug!(%child, %parent, %event, "Parent does not accept event; skipped");
        return Ok(Delivery::Skipped);
    }

    match handle.fire(event) {
        Ok(()) => {
            tracing::info!(%child, %parent, %event, "Parent notified");
            Ok(Delivery::Fired)
        }
        Err(Error::InvalidTransition { .. }) | Err(Error::GuardRejected { .. }) => {
            tracing::debug!(%child, %parent, %event, "Parent moved on before delivery; skipped");
            Ok(Delivery::Skipped)
        }
        // The parent transitioned; its own marker retries its follow-ups
        Err(err @ Error::FollowUpFailed { .. }) => {
            tracing::warn!(
                %child,
                %parent,
                %event,
                error = %err,
                "Parent notified; its follow-ups failed"
            );
            Ok(Delivery::Fired)
        }
        Err(err) => Err(err),
    }
}
