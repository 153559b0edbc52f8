// Outbound seam for forwarded impressions. Fire-and-forget: the pipeline never
// waits on, retries, or re-queues a send.

use std::cell::RefCell;

use crate::error::Result;
use crate::types::ImpressionEvent;

/// Ships an event to the analytics backend.
pub trait Transport {
    fn send_event(&self, event: &ImpressionEvent) -> Result<()>;
}

/// Collects forwarded events for the host to drain in batches,
/// keeping JS↔WASM crossings to one per drain.
#[derive(Debug, Default)]
pub struct BufferedTransport {
    outbox: RefCell<Vec<ImpressionEvent>>,
}

impl BufferedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every event sent since the last drain.
    pub fn drain(&self) -> Vec<ImpressionEvent> {
        std::mem::take(&mut *self.outbox.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.outbox.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbox.borrow().is_empty()
    }
}

impl Transport for BufferedTransport {
    fn send_event(&self, event: &ImpressionEvent) -> Result<()> {
        self.outbox.borrow_mut().push(event.clone());
        Ok(())
    }
}
