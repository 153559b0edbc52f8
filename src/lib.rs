// impression_core: Rust/WASM impression tracking.
// Dwell-time visibility detection, debouncing, and deduplicated analytics delivery.
// JS is plumbing: it hands over elements and callbacks, the decisions live here.

pub mod binding;
pub mod debounce;
pub mod debug;
pub mod dedup;
pub mod detector;
pub mod dom;
mod error;
pub mod geometry;
pub mod observer;
pub mod pipeline;
pub mod scheduler;
pub mod transport;
mod types;
pub mod visibility;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use js_sys::Function;
use tracing::warn;
use wasm_bindgen::prelude::*;
use web_sys::Element;

pub use binding::RefBindingManager;
pub use debounce::{debounce, Debounced};
pub use debug::{DebugHighlighter, HighlightPainter};
pub use dedup::{ImpressionDeduper, SharedDeduper};
pub use detector::{DetectorHandle, Sighting, VisibilityDetector, VisibleCallback};
pub use error::{Result, TrackerError};
pub use observer::{
    FakeObserver, IntersectionListener, IntersectionSource, PollingObserver, RectProvider,
    SharedSource, Subscription,
};
pub use pipeline::{ImpressionPipeline, ImpressionRef};
pub use scheduler::{Scheduler, SharedScheduler, Task, TimerId, VirtualScheduler};
pub use transport::{BufferedTransport, Transport};
pub use types::*;
pub use visibility::{DetectorPhase, VisibilityLedger, VisibilityState};

use dom::{
    BrowserScheduler, DomHighlightPainter, DomIntersectionObserver, DomRectProvider, JsTransport,
    NodeRegistry,
};

/// Initialize panic hook for better error messages in browser console.
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn to_js(err: TrackerError) -> JsValue {
    JsValue::from_str(&err.to_string())
}

/// Milliseconds from a JS number. Negative, NaN, and infinite values mean zero.
fn millis(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

/// Impression engine exposed to JavaScript.
///
/// Each UI element slot is identified by a host-chosen integer; the host calls
/// the slot's attach method from its ref callback with the element, or `null`
/// on unmount, and `release` when the slot goes away for good.
#[wasm_bindgen]
pub struct Engine {
    config: TrackerConfig,
    nodes: NodeRegistry,
    pipeline: ImpressionPipeline,
    highlighter: DebugHighlighter,
    outbox: Option<Rc<BufferedTransport>>,
    polling: Option<Rc<PollingObserver>>,
    visibility_slots: HashMap<u32, RefBindingManager>,
    impression_slots: HashMap<u32, ImpressionRef>,
    callbacks: Vec<(Function, VisibleCallback)>,
}

#[wasm_bindgen]
impl Engine {
    /// `send_event` receives each forwarded impression as a JSON string. Without
    /// it, impressions are buffered until `drainEvents` is called.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str, send_event: Option<Function>) -> std::result::Result<Engine, JsValue> {
        let config: TrackerConfig = serde_json::from_str(config_json)
            .map_err(|e| to_js(TrackerError::InvalidConfig(e.to_string())))?;

        let scheduler: Rc<BrowserScheduler> = Rc::new(BrowserScheduler::new().map_err(to_js)?);
        let nodes = NodeRegistry::new();

        let mut polling = None;
        let source: SharedSource = match DomIntersectionObserver::new(nodes.clone(), config.threshold()) {
            Ok(observer) => Rc::new(observer),
            Err(err) => {
                warn!(error = %err, "falling back to polled geometry");
                let provider = DomRectProvider::new(nodes.clone()).map_err(to_js)?;
                let observer = PollingObserver::new(
                    Rc::new(provider),
                    config.threshold(),
                    scheduler.clone(),
                    config.poll_debounce_ms,
                );
                polling = Some(observer.clone());
                observer
            }
        };

        let mut outbox = None;
        let transport: Rc<dyn Transport> = match send_event {
            Some(send_event) => Rc::new(JsTransport::new(send_event)),
            None => {
                let buffered = Rc::new(BufferedTransport::new());
                outbox = Some(buffered.clone());
                buffered
            }
        };

        let highlighter = DebugHighlighter::new(
            Rc::new(DomHighlightPainter::new(nodes.clone())),
            scheduler.clone(),
        );
        let pipeline = ImpressionPipeline::new(
            source,
            scheduler,
            ImpressionDeduper::shared(),
            transport,
            config.clone(),
        );
        if config.debug_overlay {
            pipeline.set_highlighter(highlighter.clone());
        }

        Ok(Engine {
            config,
            nodes,
            pipeline,
            highlighter,
            outbox,
            polling,
            visibility_slots: HashMap::new(),
            impression_slots: HashMap::new(),
            callbacks: Vec::new(),
        })
    }

    /// Ref callback for plain visibility tracking. `on_visible(timestampMs)` runs
    /// once after the element has been continuously visible for `visible_after_ms`.
    /// Passing the same element, function, and threshold again is a no-op.
    #[wasm_bindgen(js_name = attachVisibilityTracking)]
    pub fn attach_visibility_tracking(
        &mut self,
        slot: u32,
        element: Option<Element>,
        on_visible: Option<Function>,
        visible_after_ms: f64,
    ) {
        let node = element.map(|element| self.nodes.id_for(&element));
        let callback = on_visible.map(|f| self.callback_for(f));
        let pipeline = &self.pipeline;
        self.visibility_slots
            .entry(slot)
            .or_insert_with(|| pipeline.binding_manager())
            .attach(node, callback, millis(visible_after_ms));
        self.prune_nodes();
    }

    /// Ref callback for an impression. The event is forwarded at most once per
    /// session, after its element has been visible for the dwell threshold
    /// (the configured default when `visible_after_ms` is omitted).
    #[wasm_bindgen(js_name = trackImpression)]
    pub fn track_impression(
        &mut self,
        slot: u32,
        element: Option<Element>,
        event_json: &str,
        visible_after_ms: Option<f64>,
    ) -> std::result::Result<(), JsValue> {
        let event: ImpressionEvent =
            serde_json::from_str(event_json).map_err(|e| to_js(TrackerError::from(e)))?;
        let visible_after_ms = visible_after_ms
            .map(millis)
            .unwrap_or(self.config.visible_after_ms);
        let node = element.map(|element| self.nodes.id_for(&element));

        let pipeline = &self.pipeline;
        let tracked = self
            .impression_slots
            .entry(slot)
            .or_insert_with(|| pipeline.track_impression_after(event.clone(), visible_after_ms));
        tracked.set_event(event);
        tracked.set_visible_after_ms(visible_after_ms);
        tracked.attach(node);

        self.prune_nodes();
        Ok(())
    }

    /// Drop a slot and everything bound through it.
    pub fn release(&mut self, slot: u32) {
        self.visibility_slots.remove(&slot);
        self.impression_slots.remove(&slot);
        self.prune_nodes();
    }

    /// Outline `element` for `duration_ms`. Diagnostic only.
    #[wasm_bindgen(js_name = flagElement)]
    pub fn flag_element(&mut self, element: Element, duration_ms: f64) {
        let node = self.nodes.id_for(&element);
        self.highlighter.flag(node, millis(duration_ms));
    }

    /// Scroll/resize hook. Only needed when running on polled geometry.
    #[wasm_bindgen(js_name = notifyLayoutChange)]
    pub fn notify_layout_change(&self) {
        if let Some(polling) = &self.polling {
            polling.request_poll();
        }
    }

    #[wasm_bindgen(js_name = usesPolling)]
    pub fn uses_polling(&self) -> bool {
        self.polling.is_some()
    }

    /// Number of distinct impressions forwarded this session.
    #[wasm_bindgen(js_name = forwardedCount)]
    pub fn forwarded_count(&self) -> u32 {
        self.pipeline.deduper().borrow().len() as u32
    }

    /// Forget every forwarded impression. For session boundaries and tests.
    #[wasm_bindgen(js_name = resetSession)]
    pub fn reset_session(&mut self) {
        self.pipeline.deduper().borrow_mut().reset();
    }

    /// Buffered impressions as a JSON array (empty when a `send_event` was given).
    #[wasm_bindgen(js_name = drainEvents)]
    pub fn drain_events(&self) -> std::result::Result<String, JsValue> {
        let events = self
            .outbox
            .as_ref()
            .map(|outbox| outbox.drain())
            .unwrap_or_default();
        serde_json::to_string(&events).map_err(|e| to_js(TrackerError::from(e)))
    }
}

impl Engine {
    /// Same JS function, same callback: keeps re-renders from rebinding.
    fn callback_for(&mut self, f: Function) -> VisibleCallback {
        self.callbacks.retain(|(_, callback)| callback.holders() > 1);
        if let Some((_, callback)) = self.callbacks.iter().find(|(known, _)| *known == f) {
            return callback.clone();
        }

        let js = f.clone();
        let callback = VisibleCallback::new(move |sighting: Sighting| {
            let at = JsValue::from_f64(sighting.visible_at.as_millis() as f64);
            if let Err(err) = js.call1(&JsValue::NULL, &at) {
                warn!(node = %sighting.node, error = ?err, "onVisible callback threw");
            }
        });
        self.callbacks.push((f, callback.clone()));
        callback
    }

    /// Forget elements no slot or debug marker refers to anymore.
    fn prune_nodes(&self) {
        let in_use: HashSet<NodeId> = self
            .visibility_slots
            .values()
            .filter_map(|manager| manager.node())
            .chain(self.impression_slots.values().filter_map(|tracked| tracked.node()))
            .collect();
        let highlighter = &self.highlighter;
        self.nodes
            .retain(|node| in_use.contains(&node) || highlighter.is_flagged(node));
    }
}
