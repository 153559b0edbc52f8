// Ref-callback adapter. The UI layer reports "this node now goes with this callback"
// or "nothing anymore"; the manager keeps exactly one detector for the current pair.

use tracing::debug;

use crate::detector::{DetectorHandle, VisibilityDetector, VisibleCallback};
use crate::observer::SharedSource;
use crate::scheduler::SharedScheduler;
use crate::types::NodeId;
use crate::visibility::DetectorPhase;

/// Owns at most one live [`VisibilityDetector`] for one UI element slot.
pub struct RefBindingManager {
    source: SharedSource,
    scheduler: SharedScheduler,
    current: Option<Binding>,
}

struct Binding {
    node: NodeId,
    on_visible: VisibleCallback,
    visible_after_ms: u64,
    handle: DetectorHandle,
}

impl Binding {
    fn matches(&self, node: NodeId, on_visible: &VisibleCallback, visible_after_ms: u64) -> bool {
        self.node == node && self.on_visible == *on_visible && self.visible_after_ms == visible_after_ms
    }
}

impl RefBindingManager {
    pub fn new(source: SharedSource, scheduler: SharedScheduler) -> Self {
        RefBindingManager {
            source,
            scheduler,
            current: None,
        }
    }

    /// Ref callback entry point.
    ///
    /// With both a node and a callback, (re)binds unless the triple is unchanged.
    /// With either one missing, releases the current binding: that covers unmount,
    /// callback removal, and half-specified calls alike.
    pub fn attach(
        &mut self,
        node: Option<NodeId>,
        on_visible: Option<VisibleCallback>,
        visible_after_ms: u64,
    ) {
        let (node, on_visible) = match (node, on_visible) {
            (Some(node), Some(on_visible)) => (node, on_visible),
            (node, on_visible) => {
                if node.is_some() != on_visible.is_some() {
                    debug!(?node, "half-specified binding treated as detach");
                }
                self.detach();
                return;
            }
        };

        if let Some(binding) = &self.current {
            if binding.matches(node, &on_visible, visible_after_ms) {
                return;
            }
        }

        // Release first: the old detector must be gone before the new one observes.
        self.detach();
        debug!(%node, visible_after_ms, "binding visibility tracking");
        let handle = VisibilityDetector::watch(
            self.source.clone(),
            self.scheduler.clone(),
            node,
            visible_after_ms,
            on_visible.clone(),
        );
        self.current = Some(Binding {
            node,
            on_visible,
            visible_after_ms,
            handle,
        });
    }

    /// Tear down the current binding, if any.
    pub fn detach(&mut self) {
        if let Some(binding) = self.current.take() {
            debug!(node = %binding.node, "releasing visibility tracking");
            binding.handle.teardown();
        }
    }

    pub fn is_bound(&self) -> bool {
        self.current.is_some()
    }

    pub fn node(&self) -> Option<NodeId> {
        self.current.as_ref().map(|b| b.node)
    }

    pub fn phase(&self) -> DetectorPhase {
        self.current
            .as_ref()
            .map(|b| b.handle.phase())
            .unwrap_or(DetectorPhase::Unbound)
    }
}

impl Drop for RefBindingManager {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::FakeObserver;
    use crate::scheduler::VirtualScheduler;
    use crate::types::Timestamp;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Rig {
        fake: Rc<FakeObserver>,
        scheduler: Rc<VirtualScheduler>,
        manager: RefBindingManager,
        fired: Rc<RefCell<Vec<(&'static str, u64)>>>,
    }

    impl Rig {
        fn new() -> Self {
            let fake = Rc::new(FakeObserver::new());
            let scheduler = Rc::new(VirtualScheduler::new());
            let manager = RefBindingManager::new(fake.clone(), scheduler.clone());
            Rig {
                fake,
                scheduler,
                manager,
                fired: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn callback(&self, name: &'static str) -> VisibleCallback {
            let sink = self.fired.clone();
            VisibleCallback::new(move |s| sink.borrow_mut().push((name, s.visible_at.as_millis())))
        }

        fn advance_to(&self, ms: u64) {
            self.scheduler.advance_to(Timestamp::from_millis(ms));
        }
    }

    #[test]
    fn unchanged_triple_does_not_restart_timer() {
        let mut rig = Rig::new();
        let node = NodeId::new(1);
        let cb = rig.callback("a");
        rig.fake.set_intersecting(node, true);

        rig.manager.attach(Some(node), Some(cb.clone()), 500);
        rig.advance_to(400);
        rig.manager.attach(Some(node), Some(cb.clone()), 500);
        assert_eq!(rig.fake.observer_count(node), 1);

        rig.advance_to(500);
        assert_eq!(*rig.fired.borrow(), vec![("a", 500)]);
    }

    #[test]
    fn new_callback_rebinds_and_restarts() {
        let mut rig = Rig::new();
        let node = NodeId::new(1);
        rig.fake.set_intersecting(node, true);

        let a = rig.callback("a");
        rig.manager.attach(Some(node), Some(a), 500);
        rig.advance_to(400);
        let b = rig.callback("b");
        rig.manager.attach(Some(node), Some(b), 500);
        assert_eq!(rig.fake.observer_count(node), 1);

        rig.advance_to(2_000);
        assert_eq!(*rig.fired.borrow(), vec![("b", 900)]);
    }

    #[test]
    fn changed_threshold_rebinds() {
        let mut rig = Rig::new();
        let node = NodeId::new(1);
        let cb = rig.callback("a");
        rig.fake.set_intersecting(node, true);

        rig.manager.attach(Some(node), Some(cb.clone()), 500);
        rig.manager.attach(Some(node), Some(cb), 100);
        rig.advance_to(2_000);
        assert_eq!(*rig.fired.borrow(), vec![("a", 100)]);
    }

    #[test]
    fn new_node_releases_previous() {
        let mut rig = Rig::new();
        let first = NodeId::new(1);
        let second = NodeId::new(2);
        let cb = rig.callback("a");
        rig.manager.attach(Some(first), Some(cb.clone()), 100);
        rig.manager.attach(Some(second), Some(cb), 100);
        assert_eq!(rig.fake.observer_count(first), 0);
        assert_eq!(rig.fake.observer_count(second), 1);
        assert_eq!(rig.manager.node(), Some(second));
    }

    #[test]
    fn null_node_or_callback_detaches() {
        let mut rig = Rig::new();
        let node = NodeId::new(1);
        rig.fake.set_intersecting(node, true);

        let a = rig.callback("a");
        rig.manager.attach(Some(node), Some(a.clone()), 500);
        rig.manager.attach(None, Some(a), 500);
        assert!(!rig.manager.is_bound());

        let b = rig.callback("b");
        rig.manager.attach(Some(node), Some(b), 500);
        rig.manager.attach(Some(node), None, 500);
        assert_eq!(rig.manager.phase(), DetectorPhase::Unbound);
        assert_eq!(rig.fake.total_observers(), 0);

        rig.advance_to(5_000);
        assert!(rig.fired.borrow().is_empty());
    }

    #[test]
    fn dropping_manager_releases_binding() {
        let rig = Rig::new();
        let Rig {
            fake,
            scheduler,
            mut manager,
            fired,
        } = rig;
        let node = NodeId::new(1);
        fake.set_intersecting(node, true);
        let sink = fired.clone();
        manager.attach(
            Some(node),
            Some(VisibleCallback::new(move |_| sink.borrow_mut().push(("a", 0)))),
            100,
        );
        drop(manager);
        scheduler.advance_by(1_000);
        assert!(fired.borrow().is_empty());
        assert_eq!(fake.total_observers(), 0);
    }
}
