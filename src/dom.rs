// Browser adapters: window timers, IntersectionObserver, bounding rects, outline painting,
// and the JS sendEvent callback. Thin plumbing over web-sys; the logic lives elsewhere.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use js_sys::{Array, Function};
use tracing::{trace, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{Element, HtmlElement, IntersectionObserver, IntersectionObserverEntry, IntersectionObserverInit, Window};

use crate::debug::HighlightPainter;
use crate::error::{Result, TrackerError};
use crate::observer::{IntersectionListener, IntersectionSource, Listeners, RectProvider, Subscription};
use crate::scheduler::{Scheduler, Task, TimerId};
use crate::transport::Transport;
use crate::types::{ImpressionEvent, NodeId, Rect, Timestamp};

const DEBUG_OUTLINE: &str = "3px solid #ff00aa";

fn js_error(context: &str, err: JsValue) -> TrackerError {
    TrackerError::ObservationUnavailable(format!("{}: {:?}", context, err))
}

fn window() -> Result<Window> {
    web_sys::window().ok_or_else(|| TrackerError::ObservationUnavailable("no window".to_string()))
}

/// Maps host elements to the opaque [`NodeId`]s the core works with.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    inner: Rc<RefCell<NodeTable>>,
}

#[derive(Default)]
struct NodeTable {
    next_id: u64,
    nodes: Vec<(NodeId, Element)>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `element`, assigning one the first time it is seen.
    pub fn id_for(&self, element: &Element) -> NodeId {
        let mut table = self.inner.borrow_mut();
        if let Some((id, _)) = table.nodes.iter().find(|(_, e)| e == element) {
            return *id;
        }
        let id = NodeId::new(table.next_id);
        table.next_id += 1;
        table.nodes.push((id, element.clone()));
        id
    }

    pub fn element(&self, node: NodeId) -> Option<Element> {
        self.inner
            .borrow()
            .nodes
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, e)| e.clone())
    }

    fn lookup(&self, element: &Element) -> Option<NodeId> {
        self.inner
            .borrow()
            .nodes
            .iter()
            .find(|(_, e)| e == element)
            .map(|(id, _)| *id)
    }

    pub fn forget(&self, node: NodeId) {
        self.retain(|id| id != node);
    }

    /// Keep only the elements whose id passes `keep`.
    pub fn retain(&self, mut keep: impl FnMut(NodeId) -> bool) {
        self.inner.borrow_mut().nodes.retain(|(id, _)| keep(*id));
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().nodes.is_empty()
    }
}

/// Scheduler on `window.setTimeout`, clocked by `Date.now()`.
///
/// Each timer owns its JS closure. Clearing a timer frees the closure right
/// away; a closure that ran is freed by the next timer to run, never by itself.
pub struct BrowserScheduler {
    window: Window,
    next_id: Cell<u64>,
    timers: Rc<RefCell<TimerTable>>,
}

#[derive(Default)]
struct TimerTable {
    pending: HashMap<u64, PendingTimer>,
    spent: Vec<Closure<dyn FnMut()>>,
}

struct PendingTimer {
    handle: i32,
    task: Task,
    callback: Closure<dyn FnMut()>,
}

impl BrowserScheduler {
    pub fn new() -> Result<Self> {
        Ok(BrowserScheduler {
            window: window()?,
            next_id: Cell::new(0),
            timers: Rc::new(RefCell::new(TimerTable::default())),
        })
    }

    /// Timers scheduled and not yet run or cleared.
    pub fn pending(&self) -> usize {
        self.timers.borrow().pending.len()
    }
}

impl Scheduler for BrowserScheduler {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(js_sys::Date::now().max(0.0) as u64)
    }

    fn set_timeout(&self, delay_ms: u64, task: Task) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let timers: Weak<RefCell<TimerTable>> = Rc::downgrade(&self.timers);
        let callback = Closure::<dyn FnMut()>::new(move || {
            let timers = match timers.upgrade() {
                Some(timers) => timers,
                None => return,
            };
            let (task, retired) = {
                let mut table = timers.borrow_mut();
                let retired = std::mem::take(&mut table.spent);
                let task = match table.pending.remove(&id) {
                    Some(timer) => {
                        table.spent.push(timer.callback);
                        Some(timer.task)
                    }
                    None => None,
                };
                (task, retired)
            };
            drop(retired);
            if let Some(task) = task {
                task();
            }
        });

        let delay = delay_ms.min(i32::MAX as u64) as i32;
        match self.window.set_timeout_with_callback_and_timeout_and_arguments_0(
            callback.as_ref().unchecked_ref(),
            delay,
        ) {
            Ok(handle) => {
                self.timers.borrow_mut().pending.insert(
                    id,
                    PendingTimer {
                        handle,
                        task,
                        callback,
                    },
                );
            }
            Err(err) => warn!(error = ?err, "setTimeout failed; task dropped"),
        }
        TimerId::new(id)
    }

    fn clear_timeout(&self, id: TimerId) {
        let timer = self.timers.borrow_mut().pending.remove(&id.as_u64());
        if let Some(timer) = timer {
            self.window.clear_timeout_with_handle(timer.handle);
            // Task and closure are dropped here, outside the borrow.
            drop(timer);
        }
    }
}

impl Drop for BrowserScheduler {
    fn drop(&mut self) {
        let pending: Vec<PendingTimer> = self.timers.borrow_mut().pending.drain().map(|(_, t)| t).collect();
        for timer in pending {
            self.window.clear_timeout_with_handle(timer.handle);
        }
    }
}

/// One shared browser `IntersectionObserver` fanning entries out to listeners.
pub struct DomIntersectionObserver {
    nodes: NodeRegistry,
    observer: IntersectionObserver,
    listeners: Rc<RefCell<Listeners>>,
    _callback: Closure<dyn FnMut(Array, IntersectionObserver)>,
}

impl DomIntersectionObserver {
    /// Fails with `ObservationUnavailable` where `IntersectionObserver` is unsupported.
    pub fn new(nodes: NodeRegistry, threshold: f64) -> Result<Self> {
        let listeners: Rc<RefCell<Listeners>> = Rc::new(RefCell::new(Listeners::default()));

        let registry = nodes.clone();
        let fan_out = listeners.clone();
        let callback = Closure::<dyn FnMut(Array, IntersectionObserver)>::new(
            move |entries: Array, _observer: IntersectionObserver| {
                for entry in entries.iter() {
                    let entry: IntersectionObserverEntry = entry.unchecked_into();
                    let node = match registry.lookup(&entry.target()) {
                        Some(node) => node,
                        None => continue,
                    };
                    let intersecting = entry.is_intersecting()
                        && (threshold <= 0.0 || entry.intersection_ratio() >= threshold);
                    let targets = fan_out.borrow_mut().report(node, intersecting);
                    trace!(%node, intersecting, "intersection entry");
                    for listener in targets {
                        listener(intersecting);
                    }
                }
            },
        );

        let init = IntersectionObserverInit::new();
        init.set_threshold(&JsValue::from_f64(threshold));
        let observer = IntersectionObserver::new_with_options(callback.as_ref().unchecked_ref(), &init)
            .map_err(|err| js_error("IntersectionObserver", err))?;

        Ok(DomIntersectionObserver {
            nodes,
            observer,
            listeners,
            _callback: callback,
        })
    }
}

impl IntersectionSource for DomIntersectionObserver {
    fn observe(&self, node: NodeId, listener: IntersectionListener) -> Result<Subscription> {
        let element = self
            .nodes
            .element(node)
            .ok_or_else(|| TrackerError::ObservationUnavailable(format!("{} is not registered", node)))?;
        let (first, subscription, replay) = {
            let mut listeners = self.listeners.borrow_mut();
            let first = listeners.count_for(node) == 0;
            let replay = listeners.last_report(node);
            (first, listeners.insert(node, listener.clone()), replay)
        };
        if first {
            // The browser delivers the element's current state asynchronously.
            self.observer.observe(&element);
        } else if let Some(intersecting) = replay {
            // Already observed: the browser will not send another initial entry.
            listener(intersecting);
        }
        Ok(subscription)
    }

    fn unobserve(&self, subscription: Subscription) {
        let released = {
            let mut listeners = self.listeners.borrow_mut();
            listeners
                .remove(subscription)
                .filter(|node| listeners.count_for(*node) == 0)
        };
        if let Some(element) = released.and_then(|node| self.nodes.element(node)) {
            self.observer.unobserve(&element);
        }
    }
}

impl Drop for DomIntersectionObserver {
    fn drop(&mut self) {
        self.observer.disconnect();
    }
}

/// Geometry from `getBoundingClientRect` and the window's inner size.
pub struct DomRectProvider {
    window: Window,
    nodes: NodeRegistry,
}

impl DomRectProvider {
    pub fn new(nodes: NodeRegistry) -> Result<Self> {
        Ok(DomRectProvider {
            window: window()?,
            nodes,
        })
    }
}

impl RectProvider for DomRectProvider {
    fn viewport(&self) -> Result<Rect> {
        let width = self
            .window
            .inner_width()
            .map_err(|err| js_error("innerWidth", err))?
            .as_f64()
            .unwrap_or(0.0);
        let height = self
            .window
            .inner_height()
            .map_err(|err| js_error("innerHeight", err))?
            .as_f64()
            .unwrap_or(0.0);
        Ok(Rect::new(0.0, 0.0, width, height))
    }

    fn bounds(&self, node: NodeId) -> Result<Option<Rect>> {
        Ok(self.nodes.element(node).and_then(|element| {
            if !element.is_connected() {
                return None;
            }
            let r = element.get_bounding_client_rect();
            Some(Rect::new(r.x(), r.y(), r.width(), r.height()))
        }))
    }
}

/// Outlines elements with an inline style.
pub struct DomHighlightPainter {
    nodes: NodeRegistry,
}

impl DomHighlightPainter {
    pub fn new(nodes: NodeRegistry) -> Self {
        DomHighlightPainter { nodes }
    }

    fn html_element(&self, node: NodeId) -> Option<HtmlElement> {
        self.nodes
            .element(node)
            .and_then(|element| element.dyn_into::<HtmlElement>().ok())
    }
}

impl HighlightPainter for DomHighlightPainter {
    fn paint(&self, node: NodeId) -> Result<()> {
        let element = self
            .html_element(node)
            .ok_or_else(|| TrackerError::ObservationUnavailable(format!("{} has no style", node)))?;
        element
            .style()
            .set_property("outline", DEBUG_OUTLINE)
            .map_err(|err| js_error("style.outline", err))
    }

    fn clear(&self, node: NodeId) {
        if let Some(element) = self.html_element(node) {
            let _ = element.style().remove_property("outline");
        }
    }
}

/// Calls a JS `sendEvent(json)` function with the event serialized as JSON.
pub struct JsTransport {
    send_event: Function,
}

impl JsTransport {
    pub fn new(send_event: Function) -> Self {
        JsTransport { send_event }
    }
}

impl Transport for JsTransport {
    fn send_event(&self, event: &ImpressionEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.send_event
            .call1(&JsValue::NULL, &JsValue::from_str(&json))
            .map(|_| ())
            .map_err(|err| TrackerError::Transport(format!("{:?}", err)))
    }
}
