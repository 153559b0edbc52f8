// Impression pipeline: a visibility detector fires, the dedup gate decides, the transport sends.
// The ledger records an impression before it is sent, so a failed send is
// dropped rather than retried or re-forwarded on a later sighting.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::binding::RefBindingManager;
use crate::debug::DebugHighlighter;
use crate::dedup::SharedDeduper;
use crate::detector::{Sighting, VisibleCallback};
use crate::observer::SharedSource;
use crate::scheduler::SharedScheduler;
use crate::transport::Transport;
use crate::types::{ImpressionEvent, NodeId, TrackerConfig};
use crate::visibility::DetectorPhase;

/// Composes visibility tracking, deduplication, and delivery.
/// Cheap to clone; clones share the deduper and transport.
#[derive(Clone)]
pub struct ImpressionPipeline {
    inner: Rc<PipelineInner>,
}

struct PipelineInner {
    source: SharedSource,
    scheduler: SharedScheduler,
    deduper: SharedDeduper,
    transport: Rc<dyn Transport>,
    config: TrackerConfig,
    highlighter: RefCell<Option<DebugHighlighter>>,
}

impl ImpressionPipeline {
    pub fn new(
        source: SharedSource,
        scheduler: SharedScheduler,
        deduper: SharedDeduper,
        transport: Rc<dyn Transport>,
        config: TrackerConfig,
    ) -> Self {
        ImpressionPipeline {
            inner: Rc::new(PipelineInner {
                source,
                scheduler,
                deduper,
                transport,
                config,
                highlighter: RefCell::new(None),
            }),
        }
    }

    /// Outline forwarded elements when `debug_overlay` is on.
    pub fn set_highlighter(&self, highlighter: DebugHighlighter) {
        *self.inner.highlighter.borrow_mut() = Some(highlighter);
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn deduper(&self) -> SharedDeduper {
        self.inner.deduper.clone()
    }

    /// A fresh binding manager on this pipeline's observer and clock, for
    /// callers that want plain visibility callbacks without impressions.
    pub fn binding_manager(&self) -> RefBindingManager {
        RefBindingManager::new(self.inner.source.clone(), self.inner.scheduler.clone())
    }

    /// Dedup `event` and send it if it is new. Returns whether it was forwarded.
    /// Transport failures are logged and swallowed; the event stays recorded.
    pub fn forward(&self, event: &ImpressionEvent) -> bool {
        self.inner.forward(event, None)
    }

    /// Track `event` with the configured default dwell threshold.
    pub fn track_impression(&self, event: ImpressionEvent) -> ImpressionRef {
        let visible_after_ms = self.inner.config.visible_after_ms;
        self.track_impression_after(event, visible_after_ms)
    }

    /// Track `event`, forwarding it once its element has been visible for `visible_after_ms`.
    /// Attach the element through the returned [`ImpressionRef`].
    pub fn track_impression_after(&self, event: ImpressionEvent, visible_after_ms: u64) -> ImpressionRef {
        let callback = self.inner.callback_for(&event);
        ImpressionRef {
            pipeline: self.inner.clone(),
            manager: self.binding_manager(),
            event,
            callback,
            visible_after_ms,
            node: None,
        }
    }
}

impl PipelineInner {
    fn callback_for(self: &Rc<Self>, event: &ImpressionEvent) -> VisibleCallback {
        let pipeline = Rc::downgrade(self);
        let event = event.clone();
        VisibleCallback::new(move |sighting: Sighting| {
            if let Some(pipeline) = pipeline.upgrade() {
                pipeline.forward(&event, Some(sighting.node));
            }
        })
    }

    fn forward(&self, event: &ImpressionEvent, node: Option<NodeId>) -> bool {
        let fresh = self.deduper.borrow_mut().should_forward(event);
        if !fresh {
            return false;
        }

        debug!(category = %event.category, ?node, "forwarding impression");
        if let Err(err) = self.transport.send_event(event) {
            warn!(category = %event.category, error = %err, "impression dropped after transport failure");
        }

        let highlighter = self.highlighter.borrow().clone();
        if let (Some(node), Some(highlighter)) = (node, highlighter) {
            if self.config.debug_overlay {
                highlighter.flag(node, self.config.debug_flag_ms);
            }
        }
        true
    }
}

/// Ref-callback handle for one tracked impression.
///
/// Hand `attach` the element when it mounts and `None` when it unmounts.
/// Dropping the handle releases the binding.
pub struct ImpressionRef {
    pipeline: Rc<PipelineInner>,
    manager: RefBindingManager,
    event: ImpressionEvent,
    callback: VisibleCallback,
    visible_after_ms: u64,
    node: Option<NodeId>,
}

impl ImpressionRef {
    pub fn attach(&mut self, node: Option<NodeId>) {
        self.node = node;
        self.manager
            .attach(node, Some(self.callback.clone()), self.visible_after_ms);
    }

    pub fn detach(&mut self) {
        self.attach(None);
    }

    /// Swap the tracked event. A different event is a different binding, so the
    /// dwell timer restarts; an equal event changes nothing.
    pub fn set_event(&mut self, event: ImpressionEvent) {
        if event == self.event {
            return;
        }
        self.callback = self.pipeline.callback_for(&event);
        self.event = event;
        if self.node.is_some() {
            self.attach(self.node);
        }
    }

    pub fn set_visible_after_ms(&mut self, visible_after_ms: u64) {
        if visible_after_ms == self.visible_after_ms {
            return;
        }
        self.visible_after_ms = visible_after_ms;
        if self.node.is_some() {
            self.attach(self.node);
        }
    }

    pub fn event(&self) -> &ImpressionEvent {
        &self.event
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn phase(&self) -> DetectorPhase {
        self.manager.phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::ImpressionDeduper;
    use crate::error::{Result, TrackerError};
    use crate::observer::FakeObserver;
    use crate::scheduler::VirtualScheduler;
    use crate::transport::BufferedTransport;
    use std::cell::Cell;

    struct FlakyTransport {
        attempts: Cell<u32>,
    }

    impl Transport for FlakyTransport {
        fn send_event(&self, _event: &ImpressionEvent) -> Result<()> {
            self.attempts.set(self.attempts.get() + 1);
            Err(TrackerError::Transport("503 from collector".into()))
        }
    }

    fn pipeline_with(transport: Rc<dyn Transport>) -> (ImpressionPipeline, Rc<FakeObserver>, Rc<VirtualScheduler>) {
        let fake = Rc::new(FakeObserver::new());
        let scheduler = Rc::new(VirtualScheduler::new());
        let pipeline = ImpressionPipeline::new(
            fake.clone(),
            scheduler.clone(),
            ImpressionDeduper::shared(),
            transport,
            TrackerConfig::default(),
        );
        (pipeline, fake, scheduler)
    }

    #[test]
    fn forward_gates_on_dedup() {
        let transport = Rc::new(BufferedTransport::new());
        let (pipeline, _, _) = pipeline_with(transport.clone());
        let event = ImpressionEvent::new("cta_click").with_list("home");

        assert!(pipeline.forward(&event));
        assert!(!pipeline.forward(&event.clone()));
        assert_eq!(transport.drain().len(), 1);
    }

    #[test]
    fn failed_send_is_recorded_and_never_retried() {
        let transport = Rc::new(FlakyTransport {
            attempts: Cell::new(0),
        });
        let (pipeline, fake, scheduler) = pipeline_with(transport.clone());
        let node = NodeId::new(1);
        let event = ImpressionEvent::new("hero");

        let mut first = pipeline.track_impression_after(event.clone(), 100);
        first.attach(Some(node));
        fake.set_intersecting(node, true);
        scheduler.advance_by(200);
        assert_eq!(transport.attempts.get(), 1);
        assert!(pipeline.deduper().borrow().contains(&event));

        // Remount: same impression, new binding. Still suppressed.
        drop(first);
        let mut second = pipeline.track_impression_after(event, 100);
        second.attach(Some(node));
        scheduler.advance_by(200);
        assert_eq!(second.phase(), DetectorPhase::Fired);
        assert_eq!(transport.attempts.get(), 1);
    }

    #[test]
    fn set_event_rebinds_only_when_event_changes() {
        let transport = Rc::new(BufferedTransport::new());
        let (pipeline, fake, scheduler) = pipeline_with(transport.clone());
        let node = NodeId::new(1);
        fake.set_intersecting(node, true);

        let mut tracked = pipeline.track_impression_after(ImpressionEvent::new("card").with_position(0), 500);
        tracked.attach(Some(node));
        scheduler.advance_by(300);
        tracked.set_event(ImpressionEvent::new("card").with_position(0));
        scheduler.advance_by(200);
        assert_eq!(transport.len(), 1);

        tracked.set_event(ImpressionEvent::new("card").with_position(1));
        assert_eq!(tracked.phase(), DetectorPhase::Pending);
        scheduler.advance_by(500);
        let sent = transport.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].context.position_index, Some(1));
    }

    #[test]
    fn forwarded_node_is_flagged_when_overlay_enabled() {
        use crate::debug::HighlightPainter;

        #[derive(Default)]
        struct Marks(RefCell<Vec<NodeId>>);
        impl HighlightPainter for Marks {
            fn paint(&self, node: NodeId) -> Result<()> {
                self.0.borrow_mut().push(node);
                Ok(())
            }
            fn clear(&self, _node: NodeId) {}
        }

        let fake = Rc::new(FakeObserver::new());
        let scheduler = Rc::new(VirtualScheduler::new());
        let pipeline = ImpressionPipeline::new(
            fake.clone(),
            scheduler.clone(),
            ImpressionDeduper::shared(),
            Rc::new(BufferedTransport::new()),
            TrackerConfig {
                debug_overlay: true,
                visible_after_ms: 0,
                ..Default::default()
            },
        );
        let marks = Rc::new(Marks::default());
        pipeline.set_highlighter(DebugHighlighter::new(marks.clone(), scheduler.clone()));

        let node = NodeId::new(9);
        let mut tracked = pipeline.track_impression(ImpressionEvent::new("promo"));
        tracked.attach(Some(node));
        fake.set_intersecting(node, true);
        assert_eq!(*marks.0.borrow(), vec![node]);
    }
}
