// Dwell-time visibility detector: observer + timer + VisibilityLedger for one binding.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::observer::{SharedSource, Subscription};
use crate::scheduler::{SharedScheduler, TimerId};
use crate::types::{NodeId, Timestamp};
use crate::visibility::{DetectorPhase, Transition, VisibilityLedger, VisibilityState};

/// What the detector saw when the dwell threshold was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    pub node: NodeId,
    /// When the node last became visible.
    pub visible_since: Timestamp,
    /// When the threshold was crossed.
    pub visible_at: Timestamp,
}

/// Callback invoked once a binding has been continuously visible long enough.
///
/// Identity is pointer identity: clones are the same callback, two separately
/// created callbacks are different even if they do the same thing.
#[derive(Clone)]
pub struct VisibleCallback(Rc<dyn Fn(Sighting)>);

impl VisibleCallback {
    pub fn new(f: impl Fn(Sighting) + 'static) -> Self {
        VisibleCallback(Rc::new(f))
    }

    pub fn call(&self, sighting: Sighting) {
        (self.0)(sighting)
    }

    /// Number of live clones of this callback.
    pub fn holders(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl PartialEq for VisibleCallback {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Rc::as_ptr(&self.0) as *const (),
            Rc::as_ptr(&other.0) as *const (),
        )
    }
}

impl Eq for VisibleCallback {}

impl fmt::Debug for VisibleCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VisibleCallback({:p})", Rc::as_ptr(&self.0) as *const ())
    }
}

/// Watches one node and fires its callback after `visible_after_ms` of continuous visibility.
pub struct VisibilityDetector {
    node: NodeId,
    source: SharedSource,
    scheduler: SharedScheduler,
    on_visible: VisibleCallback,
    me: Weak<VisibilityDetector>,
    /// Cleared on teardown. Checked by every listener and timer task before acting.
    alive: Cell<bool>,
    core: RefCell<DetectorCore>,
}

struct DetectorCore {
    ledger: VisibilityLedger,
    timer: Option<TimerId>,
    subscription: Option<Subscription>,
}

/// Owning handle to a running detector. Dropping it tears the detector down.
pub struct DetectorHandle {
    detector: Rc<VisibilityDetector>,
}

impl VisibilityDetector {
    /// Start watching `node`. Observation failures leave the detector inert:
    /// it logs and never fires, and the caller still gets a handle.
    pub fn watch(
        source: SharedSource,
        scheduler: SharedScheduler,
        node: NodeId,
        visible_after_ms: u64,
        on_visible: VisibleCallback,
    ) -> DetectorHandle {
        let detector = Rc::new_cyclic(|me: &Weak<VisibilityDetector>| VisibilityDetector {
            node,
            source,
            scheduler,
            on_visible,
            me: me.clone(),
            alive: Cell::new(true),
            core: RefCell::new(DetectorCore {
                ledger: VisibilityLedger::new(visible_after_ms),
                timer: None,
                subscription: None,
            }),
        });
        // Built before subscribing so an unwinding observe still releases the binding.
        let handle = DetectorHandle {
            detector: detector.clone(),
        };

        let weak = detector.self_weak();
        let listener = Rc::new(move |intersecting: bool| {
            if let Some(detector) = weak.upgrade() {
                detector.on_intersection(intersecting);
            }
        });

        match detector.source.observe(node, listener) {
            Ok(subscription) => {
                // The source may have reported and fired synchronously inside observe.
                let keep = detector.alive.get()
                    && detector.core.borrow().ledger.phase() != DetectorPhase::Fired;
                if keep {
                    detector.core.borrow_mut().subscription = Some(subscription);
                } else {
                    detector.source.unobserve(subscription);
                }
                debug!(%node, visible_after_ms, "visibility detector watching");
            }
            Err(err) => {
                warn!(%node, error = %err, "intersection observation unavailable; detector will never fire");
            }
        }

        handle
    }

    fn on_intersection(&self, intersecting: bool) {
        if !self.alive.get() {
            return;
        }
        let now = self.scheduler.now();
        let (transition, visible_after_ms) = {
            let mut core = self.core.borrow_mut();
            let transition = core.ledger.observe(intersecting, now);
            (transition, core.ledger.visible_after_ms())
        };
        trace!(node = %self.node, intersecting, ?transition, "intersection report");

        match transition {
            Transition::Nothing => {}
            Transition::StartTimer { .. } => self.arm_timer(visible_after_ms),
            Transition::CancelTimer => self.cancel_timer(),
            Transition::FireNow => self.fire(now),
        }
    }

    fn on_timer(&self) {
        // Teardown may race a timer the runtime already dequeued.
        if !self.alive.get() {
            return;
        }
        let now = self.scheduler.now();
        let (should_fire, remaining) = {
            let mut core = self.core.borrow_mut();
            core.timer = None;
            let fired = core.ledger.timer_elapsed(now);
            let remaining = match (core.ledger.phase(), core.ledger.visible_for(now)) {
                (DetectorPhase::Pending, Some(elapsed)) => {
                    Some(core.ledger.visible_after_ms().saturating_sub(elapsed))
                }
                _ => None,
            };
            (fired, remaining)
        };
        if should_fire {
            self.fire(now);
        } else if let Some(remaining) = remaining {
            // Browser timers may run a little early against Date.now().
            self.arm_timer(remaining.max(1));
        }
    }

    fn arm_timer(&self, delay_ms: u64) {
        self.cancel_timer();
        let weak = self.self_weak();
        let timer = self.scheduler.set_timeout(
            delay_ms,
            Box::new(move || {
                if let Some(detector) = weak.upgrade() {
                    detector.on_timer();
                }
            }),
        );
        self.core.borrow_mut().timer = Some(timer);
    }

    fn fire(&self, now: Timestamp) {
        let (visible_since, subscription) = {
            let mut core = self.core.borrow_mut();
            let since = core.ledger.state().became_visible_at.unwrap_or(now);
            (since, core.subscription.take())
        };
        // Fired detectors are inert; stop listening.
        if let Some(subscription) = subscription {
            self.source.unobserve(subscription);
        }
        debug!(node = %self.node, visible_since = visible_since.as_millis(), at = now.as_millis(), "dwell threshold crossed");
        self.on_visible.call(Sighting {
            node: self.node,
            visible_since,
            visible_at: now,
        });
    }

    fn cancel_timer(&self) {
        let timer = self.core.borrow_mut().timer.take();
        if let Some(timer) = timer {
            self.scheduler.clear_timeout(timer);
        }
    }

    fn teardown(&self) {
        if !self.alive.replace(false) {
            return;
        }
        let (timer, subscription) = {
            let mut core = self.core.borrow_mut();
            core.ledger.unbind();
            (core.timer.take(), core.subscription.take())
        };
        if let Some(timer) = timer {
            self.scheduler.clear_timeout(timer);
        }
        if let Some(subscription) = subscription {
            self.source.unobserve(subscription);
        }
        trace!(node = %self.node, "visibility detector torn down");
    }

    fn self_weak(&self) -> Weak<VisibilityDetector> {
        self.me.clone()
    }
}

impl DetectorHandle {
    /// Stop observing and cancel any pending timer. Safe to call repeatedly.
    pub fn teardown(&self) {
        self.detector.teardown();
    }

    pub fn node(&self) -> NodeId {
        self.detector.node
    }

    pub fn visible_after_ms(&self) -> u64 {
        self.detector.core.borrow().ledger.visible_after_ms()
    }

    pub fn phase(&self) -> DetectorPhase {
        self.detector.core.borrow().ledger.phase()
    }

    pub fn state(&self) -> VisibilityState {
        self.detector.core.borrow().ledger.state()
    }

    pub fn has_fired(&self) -> bool {
        self.phase() == DetectorPhase::Fired
    }

    pub fn is_observing(&self) -> bool {
        self.detector.core.borrow().subscription.is_some()
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.detector.teardown();
    }
}

impl fmt::Debug for DetectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorHandle")
            .field("node", &self.detector.node)
            .field("phase", &self.phase())
            .finish()
    }
}
