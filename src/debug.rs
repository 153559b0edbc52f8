// Development aid: outline an element on screen for a while, then remove the outline.
// Best effort only; nothing depends on it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::error::Result;
use crate::scheduler::{SharedScheduler, TimerId};
use crate::types::NodeId;

/// Draws and removes the on-screen marker for a node.
pub trait HighlightPainter {
    fn paint(&self, node: NodeId) -> Result<()>;
    fn clear(&self, node: NodeId);
}

/// Flags nodes for a fixed duration. Re-flagging a node extends its marker.
#[derive(Clone)]
pub struct DebugHighlighter {
    painter: Rc<dyn HighlightPainter>,
    scheduler: SharedScheduler,
    active: Rc<RefCell<HashMap<NodeId, TimerId>>>,
}

impl DebugHighlighter {
    pub fn new(painter: Rc<dyn HighlightPainter>, scheduler: SharedScheduler) -> Self {
        DebugHighlighter {
            painter,
            scheduler,
            active: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn flag(&self, node: NodeId, duration_ms: u64) {
        if let Err(err) = self.painter.paint(node) {
            debug!(%node, error = %err, "debug highlight skipped");
            return;
        }

        let previous = self.active.borrow_mut().remove(&node);
        if let Some(timer) = previous {
            self.scheduler.clear_timeout(timer);
        }

        let painter = self.painter.clone();
        let active = Rc::downgrade(&self.active);
        let timer = self.scheduler.set_timeout(
            duration_ms,
            Box::new(move || {
                if let Some(active) = active.upgrade() {
                    active.borrow_mut().remove(&node);
                }
                painter.clear(node);
            }),
        );
        self.active.borrow_mut().insert(node, timer);
    }

    pub fn is_flagged(&self, node: NodeId) -> bool {
        self.active.borrow().contains_key(&node)
    }
}
