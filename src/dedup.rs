// Session-scoped impression ledger. Append-only, insertion ordered, never pruned.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::types::ImpressionEvent;

/// Ledger shared by every pipeline in one session.
pub type SharedDeduper = Rc<RefCell<ImpressionDeduper>>;

/// Decides whether an impression has already been forwarded this session.
///
/// Identity is full structural equality of the event, so two events that
/// differ in any field (position, list, properties) are separate impressions.
#[derive(Debug, Default)]
pub struct ImpressionDeduper {
    ledger: Vec<ImpressionEvent>,
}

impl ImpressionDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// One ledger for a whole session, to be passed to every pipeline.
    pub fn shared() -> SharedDeduper {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Record `event` and return true if it is new; return false for a duplicate.
    pub fn should_forward(&mut self, event: &ImpressionEvent) -> bool {
        if self.contains(event) {
            trace!(category = %event.category, "duplicate impression suppressed");
            return false;
        }
        self.ledger.push(event.clone());
        true
    }

    pub fn contains(&self, event: &ImpressionEvent) -> bool {
        self.ledger.iter().any(|seen| seen == event)
    }

    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.is_empty()
    }

    /// Forwarded events in the order they were first seen.
    pub fn entries(&self) -> &[ImpressionEvent] {
        &self.ledger
    }

    /// Start a new session. Only meant for session boundaries and tests.
    pub fn reset(&mut self) {
        self.ledger.clear();
    }
}
