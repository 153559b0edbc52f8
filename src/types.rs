// Strong typing over raw numbers. Newtypes for timestamps and node handles, serde config.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Timestamp in milliseconds on the scheduler's clock. Newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Timestamp `ms` milliseconds later, saturating at the end of the clock.
    pub fn after(&self, ms: u64) -> Self {
        Timestamp(self.0.saturating_add(ms))
    }

    /// Milliseconds elapsed since `earlier` (zero if `earlier` is in the future).
    pub fn since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Opaque handle to a renderable element. The host maps it to its own node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Axis-aligned rectangle in CSS pixels (client coordinates).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Rect {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    pub fn left(&self) -> f64 {
        self.x
    }

    pub fn top(&self) -> f64 {
        self.y
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

/// Tracker configuration passed from JS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Dwell threshold used when a caller does not supply one (milliseconds).
    #[serde(default = "default_visible_after_ms")]
    pub visible_after_ms: u64,
    /// Minimum visible fraction of the element that counts as intersecting.
    #[serde(default)]
    pub intersection_threshold: f64,
    /// Quiet period before a burst of scroll/resize notifications re-polls geometry.
    #[serde(default = "default_poll_debounce_ms")]
    pub poll_debounce_ms: u64,
    /// Outline elements on screen when their impression is forwarded.
    #[serde(default)]
    pub debug_overlay: bool,
    /// How long a debug outline stays on screen (milliseconds).
    #[serde(default = "default_debug_flag_ms")]
    pub debug_flag_ms: u64,
}

impl TrackerConfig {
    /// Intersection threshold clamped to `[0, 1]`.
    pub fn threshold(&self) -> f64 {
        if self.intersection_threshold.is_nan() {
            0.0
        } else {
            self.intersection_threshold.clamp(0.0, 1.0)
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            visible_after_ms: default_visible_after_ms(),
            intersection_threshold: 0.0,
            poll_debounce_ms: default_poll_debounce_ms(),
            debug_overlay: false,
            debug_flag_ms: default_debug_flag_ms(),
        }
    }
}

fn default_visible_after_ms() -> u64 {
    1000
}

fn default_poll_debounce_ms() -> u64 {
    100
}

fn default_debug_flag_ms() -> u64 {
    1500
}

/// Where on the page an impression happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImpressionContext {
    /// Measurement list the element belongs to (e.g. "home", "search_results").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<String>,
    /// Element identifier inside the list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    #[serde(default, alias = "positionIndex", skip_serializing_if = "Option::is_none")]
    pub position_index: Option<u32>,
    /// Context fields the host sent that have no typed slot. Part of the identity.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Analytics event fired when an element has been seen.
///
/// Two events are the same impression iff every field is structurally equal.
/// `properties` is a JSON object; key order does not affect equality. Unknown
/// top-level fields are kept in `extra` and take part in equality too, so no
/// field the host sends is ever silently merged away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpressionEvent {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub context: ImpressionContext,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImpressionEvent {
    pub fn new(category: impl Into<String>) -> Self {
        ImpressionEvent {
            category: category.into(),
            action: None,
            context: ImpressionContext::default(),
            properties: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_list(mut self, list: impl Into<String>) -> Self {
        self.context.list = Some(list.into());
        self
    }

    pub fn with_element(mut self, element: impl Into<String>) -> Self {
        self.context.element = Some(element.into());
        self
    }

    pub fn with_position(mut self, position_index: u32) -> Self {
        self.context.position_index = Some(position_index);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
