// Intersection capability: "tell me when node X starts or stops intersecting the viewport".
// FakeObserver drives tests; PollingObserver computes intersections from rects;
// the browser IntersectionObserver adapter lives in dom.rs.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use crate::debounce::{debounce, Debounced};
use crate::error::{Result, TrackerError};
use crate::geometry::is_intersecting;
use crate::scheduler::SharedScheduler;
use crate::types::{NodeId, Rect};

/// Receives `true` when the node starts intersecting and `false` when it stops.
pub type IntersectionListener = Rc<dyn Fn(bool)>;

/// Token returned by [`IntersectionSource::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription(u64);

impl Subscription {
    pub fn new(id: u64) -> Self {
        Subscription(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Environment-owned intersection primitive.
///
/// Implementations may report the node's current state from inside `observe`
/// (as a browser observer's initial entry does); listeners must tolerate that.
pub trait IntersectionSource {
    fn observe(&self, node: NodeId, listener: IntersectionListener) -> Result<Subscription>;
    fn unobserve(&self, subscription: Subscription);
}

pub type SharedSource = Rc<dyn IntersectionSource>;

/// Listener registry shared by the concrete sources.
///
/// Also remembers the last report per node, so a source that only hears from
/// the environment once per node can still hand late subscribers the current state.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, (NodeId, IntersectionListener)>,
    last_report: HashMap<NodeId, bool>,
}

impl Listeners {
    pub(crate) fn insert(&mut self, node: NodeId, listener: IntersectionListener) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, (node, listener));
        Subscription(id)
    }

    /// Drop a subscription. The node's last report is forgotten with its last listener.
    pub(crate) fn remove(&mut self, subscription: Subscription) -> Option<NodeId> {
        let node = self.entries.remove(&subscription.0).map(|(node, _)| node)?;
        if self.count_for(node) == 0 {
            self.last_report.remove(&node);
        }
        Some(node)
    }

    /// Store a report for `node` and return everyone who should hear it.
    pub(crate) fn report(&mut self, node: NodeId, intersecting: bool) -> Vec<IntersectionListener> {
        self.last_report.insert(node, intersecting);
        self.for_node(node)
    }

    pub(crate) fn last_report(&self, node: NodeId) -> Option<bool> {
        self.last_report.get(&node).copied()
    }

    pub(crate) fn for_node(&self, node: NodeId) -> Vec<IntersectionListener> {
        self.entries
            .values()
            .filter(|(n, _)| *n == node)
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub(crate) fn count_for(&self, node: NodeId) -> usize {
        self.entries.values().filter(|(n, _)| *n == node).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Scripted intersection source for tests and headless hosts.
#[derive(Default)]
pub struct FakeObserver {
    state: RefCell<FakeState>,
}

#[derive(Default)]
struct FakeState {
    listeners: Listeners,
    intersecting: HashMap<NodeId, bool>,
    unavailable: Option<String>,
}

impl FakeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `observe` fail, as an environment without the primitive would.
    pub fn make_unavailable(&self, reason: impl Into<String>) {
        self.state.borrow_mut().unavailable = Some(reason.into());
    }

    /// Report a node's intersection state to everyone observing it.
    pub fn set_intersecting(&self, node: NodeId, intersecting: bool) {
        let listeners = {
            let mut state = self.state.borrow_mut();
            state.intersecting.insert(node, intersecting);
            state.listeners.for_node(node)
        };
        for listener in listeners {
            listener(intersecting);
        }
    }

    pub fn observer_count(&self, node: NodeId) -> usize {
        self.state.borrow().listeners.count_for(node)
    }

    pub fn total_observers(&self) -> usize {
        self.state.borrow().listeners.len()
    }
}

impl IntersectionSource for FakeObserver {
    fn observe(&self, node: NodeId, listener: IntersectionListener) -> Result<Subscription> {
        let (subscription, initially_visible) = {
            let mut state = self.state.borrow_mut();
            if let Some(reason) = &state.unavailable {
                return Err(TrackerError::ObservationUnavailable(reason.clone()));
            }
            let initially_visible = state.intersecting.get(&node).copied().unwrap_or(false);
            (state.listeners.insert(node, listener.clone()), initially_visible)
        };
        if initially_visible {
            listener(true);
        }
        Ok(subscription)
    }

    fn unobserve(&self, subscription: Subscription) {
        self.state.borrow_mut().listeners.remove(subscription);
    }
}

/// Supplies element and viewport geometry to the [`PollingObserver`].
pub trait RectProvider {
    fn viewport(&self) -> Result<Rect>;

    /// Bounds of a node in viewport coordinates; `None` when it is not rendered.
    fn bounds(&self, node: NodeId) -> Result<Option<Rect>>;
}

/// Intersection source that computes visibility from rects on demand.
///
/// Call [`poll`](PollingObserver::poll) whenever layout may have changed, or
/// [`request_poll`](PollingObserver::request_poll) from scroll/resize handlers
/// to collapse bursts into one trailing poll.
pub struct PollingObserver {
    provider: Rc<dyn RectProvider>,
    threshold: f64,
    state: RefCell<PollState>,
    repoll: Debounced<()>,
}

#[derive(Default)]
struct PollState {
    listeners: Listeners,
    last: BTreeMap<u64, bool>,
}

impl PollingObserver {
    pub fn new(
        provider: Rc<dyn RectProvider>,
        threshold: f64,
        scheduler: SharedScheduler,
        poll_debounce_ms: u64,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<PollingObserver>| {
            let weak = weak.clone();
            PollingObserver {
                provider,
                threshold,
                state: RefCell::new(PollState::default()),
                repoll: debounce(scheduler, poll_debounce_ms, move |()| {
                    if let Some(observer) = weak.upgrade() {
                        observer.poll();
                    }
                }),
            }
        })
    }

    /// Schedule a debounced re-poll.
    pub fn request_poll(&self) {
        self.repoll.call(());
    }

    /// Recompute every observed node and notify the ones whose state changed.
    /// Returns the number of notifications delivered.
    pub fn poll(&self) -> usize {
        let viewport = match self.provider.viewport() {
            Ok(viewport) => Some(viewport),
            Err(err) => {
                warn!(error = %err, "viewport unavailable; treating all nodes as off screen");
                None
            }
        };

        let changed: Vec<(IntersectionListener, bool)> = {
            let mut state = self.state.borrow_mut();
            let observed: Vec<(u64, NodeId, IntersectionListener)> = state
                .listeners
                .entries
                .iter()
                .map(|(id, (node, listener))| (*id, *node, listener.clone()))
                .collect();

            let mut changed = Vec::new();
            for (id, node, listener) in observed {
                let now_visible = viewport
                    .map(|viewport| self.node_intersects(node, &viewport))
                    .unwrap_or(false);
                let previous = state.last.insert(id, now_visible);
                if previous != Some(now_visible) {
                    trace!(%node, intersecting = now_visible, "polled intersection changed");
                    changed.push((listener, now_visible));
                }
            }
            changed
        };

        let delivered = changed.len();
        for (listener, intersecting) in changed {
            listener(intersecting);
        }
        delivered
    }

    pub fn observed(&self) -> usize {
        self.state.borrow().listeners.len()
    }

    fn node_intersects(&self, node: NodeId, viewport: &Rect) -> bool {
        match self.provider.bounds(node) {
            Ok(Some(bounds)) => is_intersecting(&bounds, viewport, self.threshold),
            Ok(None) => false,
            Err(err) => {
                warn!(%node, error = %err, "bounds unavailable; treating node as off screen");
                false
            }
        }
    }
}

impl IntersectionSource for PollingObserver {
    fn observe(&self, node: NodeId, listener: IntersectionListener) -> Result<Subscription> {
        let viewport = self.provider.viewport()?;
        let initially_visible = match self.provider.bounds(node)? {
            Some(bounds) => is_intersecting(&bounds, &viewport, self.threshold),
            None => false,
        };

        let subscription = {
            let mut state = self.state.borrow_mut();
            let subscription = state.listeners.insert(node, listener.clone());
            state.last.insert(subscription.0, initially_visible);
            subscription
        };
        if initially_visible {
            listener(true);
        }
        Ok(subscription)
    }

    fn unobserve(&self, subscription: Subscription) {
        let mut state = self.state.borrow_mut();
        state.listeners.remove(subscription);
        state.last.remove(&subscription.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;
    use std::cell::Cell;

    #[derive(Default)]
    struct ScrollingPage {
        scroll_y: Cell<f64>,
        nodes: RefCell<HashMap<NodeId, Rect>>,
        broken: Cell<bool>,
    }

    impl RectProvider for ScrollingPage {
        fn viewport(&self) -> Result<Rect> {
            if self.broken.get() {
                return Err(TrackerError::ObservationUnavailable("no layout".into()));
            }
            Ok(Rect::new(0.0, 0.0, 800.0, 600.0))
        }

        fn bounds(&self, node: NodeId) -> Result<Option<Rect>> {
            let scroll_y = self.scroll_y.get();
            Ok(self
                .nodes
                .borrow()
                .get(&node)
                .map(|r| Rect::new(r.x, r.y - scroll_y, r.width, r.height)))
        }
    }

    fn recording_listener() -> (IntersectionListener, Rc<RefCell<Vec<bool>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (Rc::new(move |v| sink.borrow_mut().push(v)), seen)
    }

    #[test]
    fn fake_observer_reports_initial_and_later_states() {
        let fake = FakeObserver::new();
        let node = NodeId::new(1);
        fake.set_intersecting(node, true);

        let (listener, seen) = recording_listener();
        let sub = fake.observe(node, listener).unwrap();
        fake.set_intersecting(node, false);
        assert_eq!(*seen.borrow(), vec![true, false]);

        fake.unobserve(sub);
        fake.set_intersecting(node, true);
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(fake.observer_count(node), 0);
    }

    #[test]
    fn fake_observer_can_be_unavailable() {
        let fake = FakeObserver::new();
        fake.make_unavailable("unsupported");
        let (listener, _) = recording_listener();
        let err = fake.observe(NodeId::new(1), listener).unwrap_err();
        assert!(matches!(err, TrackerError::ObservationUnavailable(_)));
    }

    #[test]
    fn polling_observer_notifies_on_scroll() {
        let page = Rc::new(ScrollingPage::default());
        let node = NodeId::new(7);
        page.nodes
            .borrow_mut()
            .insert(node, Rect::new(0.0, 1000.0, 200.0, 100.0));

        let scheduler = Rc::new(VirtualScheduler::new());
        let observer = PollingObserver::new(page.clone(), 0.5, scheduler.clone(), 100);
        let (listener, seen) = recording_listener();
        observer.observe(node, listener).unwrap();
        assert!(seen.borrow().is_empty());

        // Only 20px of 100 on screen: below the 0.5 threshold.
        page.scroll_y.set(420.0);
        assert_eq!(observer.poll(), 0);

        page.scroll_y.set(600.0);
        assert_eq!(observer.poll(), 1);
        assert_eq!(observer.poll(), 0);
        assert_eq!(*seen.borrow(), vec![true]);
    }

    #[test]
    fn request_poll_is_debounced() {
        let page = Rc::new(ScrollingPage::default());
        let node = NodeId::new(3);
        page.nodes
            .borrow_mut()
            .insert(node, Rect::new(0.0, 900.0, 100.0, 100.0));

        let scheduler = Rc::new(VirtualScheduler::new());
        let observer = PollingObserver::new(page.clone(), 0.0, scheduler.clone(), 100);
        let (listener, seen) = recording_listener();
        observer.observe(node, listener).unwrap();

        page.scroll_y.set(500.0);
        for _ in 0..5 {
            observer.request_poll();
            scheduler.advance_by(20);
        }
        assert!(seen.borrow().is_empty());
        scheduler.advance_by(100);
        assert_eq!(*seen.borrow(), vec![true]);
    }

    #[test]
    fn broken_geometry_fails_observe() {
        let page = Rc::new(ScrollingPage::default());
        page.broken.set(true);
        let scheduler = Rc::new(VirtualScheduler::new());
        let observer = PollingObserver::new(page, 0.0, scheduler, 100);
        let (listener, _) = recording_listener();
        assert!(observer.observe(NodeId::new(1), listener).is_err());
        assert_eq!(observer.observed(), 0);
    }

    #[test]
    fn late_subscriber_gets_the_last_report() {
        let mut listeners = Listeners::default();
        let node = NodeId::new(4);
        let (first, first_seen) = recording_listener();
        let early = listeners.insert(node, first);
        assert_eq!(listeners.last_report(node), None);

        for listener in listeners.report(node, true) {
            listener(true);
        }
        assert_eq!(*first_seen.borrow(), vec![true]);

        let (second, _) = recording_listener();
        let late = listeners.insert(node, second);
        assert_eq!(listeners.last_report(node), Some(true));

        // The report outlives one unsubscribe but not the last.
        listeners.remove(early);
        assert_eq!(listeners.last_report(node), Some(true));
        listeners.remove(late);
        assert_eq!(listeners.last_report(node), None);
    }

    #[test]
    fn second_subscriber_of_visible_node_hears_current_state() {
        let node = NodeId::new(2);

        let fake = FakeObserver::new();
        fake.set_intersecting(node, true);
        let (a, seen_a) = recording_listener();
        let (b, seen_b) = recording_listener();
        fake.observe(node, a).unwrap();
        fake.observe(node, b).unwrap();
        assert_eq!(*seen_a.borrow(), vec![true]);
        assert_eq!(*seen_b.borrow(), vec![true]);

        let page = Rc::new(ScrollingPage::default());
        page.nodes
            .borrow_mut()
            .insert(node, Rect::new(0.0, 100.0, 100.0, 100.0));
        let observer = PollingObserver::new(page, 0.0, Rc::new(VirtualScheduler::new()), 100);
        let (a, seen_a) = recording_listener();
        let (b, seen_b) = recording_listener();
        observer.observe(node, a).unwrap();
        observer.observe(node, b).unwrap();
        assert_eq!(*seen_a.borrow(), vec![true]);
        assert_eq!(*seen_b.borrow(), vec![true]);
    }
}
