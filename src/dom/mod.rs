//! Host page abstraction.
//!
//! Everything the engine needs from a live page goes through the [`Dom`]
//! trait. [`PageDom`] drives a real browser tab through `eoka`; the in-memory
//! [`fake::FakeDom`] backs the unit tests.

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
mod page;

pub use page::PageDom;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Opaque handle to an element on the current page.
///
/// Handles are only valid until the next [`Dom::release_handles`], which the
/// snapshot builder calls at the start of every observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

/// Bounding box in viewport coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

fn full_opacity() -> f64 {
    1.0
}

/// Everything the host reports about one element, measured at call time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawElement {
    /// Lowercase tag name.
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Rendered text, whitespace-collapsed.
    #[serde(default)]
    pub text: String,
    /// Live value property (form controls and contenteditable only).
    #[serde(default)]
    pub value: Option<String>,
    /// Computed `display`.
    #[serde(default)]
    pub display: String,
    /// Computed `visibility`.
    #[serde(default)]
    pub visibility: String,
    /// Computed `opacity`.
    #[serde(default = "full_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default)]
    pub disabled: bool,
    /// Option texts for native `<select>` elements.
    #[serde(default)]
    pub options: Vec<String>,
}

impl RawElement {
    /// Attribute value, `None` when absent or blank.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Whether the attribute is present at all (boolean attributes).
    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Lowercased `type` attribute, defaulting to `text` for inputs.
    pub fn input_type(&self) -> Option<String> {
        match self.attr("type") {
            Some(t) => Some(t.to_ascii_lowercase()),
            None if self.tag == "input" => Some("text".into()),
            None => None,
        }
    }
}

/// Synthetic events the executor dispatches.
#[derive(Debug, Clone, PartialEq)]
pub enum DomEvent {
    /// `input`, carrying the inserted text (None for deletions).
    Input(Option<String>),
    Change,
    Blur,
    KeyDown(String),
    KeyUp(String),
    MouseOver,
    MouseDown,
    MouseUp,
    Click,
}

impl DomEvent {
    /// DOM event type name.
    pub fn kind(&self) -> &'static str {
        match self {
            DomEvent::Input(_) => "input",
            DomEvent::Change => "change",
            DomEvent::Blur => "blur",
            DomEvent::KeyDown(_) => "keydown",
            DomEvent::KeyUp(_) => "keyup",
            DomEvent::MouseOver => "mouseover",
            DomEvent::MouseDown => "mousedown",
            DomEvent::MouseUp => "mouseup",
            DomEvent::Click => "click",
        }
    }

    /// Key or inserted data carried by keyboard/input events.
    pub fn key(&self) -> Option<&str> {
        match self {
            DomEvent::Input(data) => data.as_deref(),
            DomEvent::KeyDown(k) | DomEvent::KeyUp(k) => Some(k),
            _ => None,
        }
    }
}

/// A file to attach to a file input.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePayload {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Operations the engine performs against the host page.
///
/// Runs are single-threaded and cooperative, so implementations don't need
/// to be `Send`.
#[async_trait(?Send)]
pub trait Dom {
    async fn url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// All elements matching `selector` under `scope` (the document when
    /// `None`), in document order. Invalid selector syntax is an error.
    async fn query_all(&self, scope: Option<NodeId>, selector: &str) -> Result<Vec<NodeId>>;

    async fn describe(&self, node: NodeId) -> Result<RawElement>;

    /// Nearest inclusive ancestor matching `selector`.
    async fn closest(&self, node: NodeId, selector: &str) -> Result<Option<NodeId>>;

    async fn focus(&self, node: NodeId) -> Result<()>;

    /// Set the live value so framework-controlled inputs notice it.
    async fn set_value(&self, node: NodeId, value: &str) -> Result<()>;

    async fn dispatch(&self, node: NodeId, event: &DomEvent) -> Result<()>;

    /// Pick an option of a native `<select>` by value or visible text and
    /// fire `change`. Returns false when no option matches.
    async fn select_option(&self, node: NodeId, wanted: &str) -> Result<bool>;

    async fn scroll_into_view(&self, node: NodeId) -> Result<()>;

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()>;

    /// Move the pointer to viewport coordinates.
    async fn move_mouse(&self, x: f64, y: f64) -> Result<()>;

    /// Replace the file list of a file input and fire `change`.
    async fn attach_files(&self, node: NodeId, files: &[FilePayload]) -> Result<()>;

    /// Drop every outstanding [`NodeId`].
    async fn release_handles(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_type_defaults_to_text_for_inputs() {
        let input = RawElement {
            tag: "input".into(),
            ..Default::default()
        };
        assert_eq!(input.input_type().as_deref(), Some("text"));

        let button = RawElement {
            tag: "button".into(),
            ..Default::default()
        };
        assert_eq!(button.input_type(), None);
    }

    #[test]
    fn blank_attributes_read_as_absent() {
        let mut el = RawElement {
            tag: "input".into(),
            ..Default::default()
        };
        el.attributes.insert("id".into(), "  ".into());
        el.attributes.insert("required".into(), String::new());
        assert_eq!(el.attr("id"), None);
        assert!(el.has_attr("required"));
    }

    #[test]
    fn rect_center_and_area() {
        let r = Rect {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 40.0,
        };
        assert_eq!(r.center(), (60.0, 40.0));
        assert_eq!(r.area(), 4000.0);
        assert_eq!(Rect::default().area(), 0.0);
    }
}
