//! Snapshot builder: a bounded, serializable view of the visible page.
//!
//! Read-only. One element failing to describe never aborts the snapshot; it
//! is skipped and logged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dom::{Dom, NodeId, RawElement};
use crate::inspect::{css_escape, generate_selector, is_visible, visible_label};
use crate::obstruction::modal::is_dismiss_label;
use crate::obstruction::ChallengeInfo;
use crate::Result;

pub const INPUT_SELECTOR: &str = "input:not([type=\"hidden\"])";
pub const TEXTAREA_SELECTOR: &str = "textarea";
pub const BUTTON_SELECTOR: &str =
    "button, [role=\"button\"], input[type=\"submit\"], input[type=\"button\"]";
pub const SELECT_SELECTOR: &str = "select, [role=\"combobox\"], [role=\"listbox\"]";
pub const LABEL_SELECTOR: &str = "label, legend, [class*=\"label\"]";
pub const MODAL_SELECTOR: &str =
    "[role=\"dialog\"], [role=\"alertdialog\"], [aria-modal=\"true\"], .modal, dialog[open]";
pub const ERROR_SELECTOR: &str =
    "[role=\"alert\"], .error, .error-message, .invalid-feedback, [class*=\"error\"]";
const OPTION_SELECTOR: &str = "[role=\"option\"], option";

/// Input types rendered as buttons rather than fields.
const BUTTON_INPUT_TYPES: &[&str] = &["submit", "button", "reset", "image"];

/// Collection caps.
pub mod limits {
    pub const INPUTS: usize = 40;
    pub const TEXTAREAS: usize = 15;
    pub const BUTTONS: usize = 40;
    pub const SELECTS: usize = 20;
    pub const LABELS: usize = 15;
    pub const MODALS: usize = 5;
    pub const ERRORS: usize = 10;
    pub const OPTIONS: usize = 20;
    pub const MODAL_CHILDREN: usize = 10;
    pub const VALUE_CHARS: usize = 100;
    pub const TEXT_CHARS: usize = 100;
    pub const CLASS_CHARS: usize = 100;
    pub const ERROR_CHARS: usize = 200;
    pub const DATA_ATTRS: usize = 5;
    pub const DATA_ATTR_CHARS: usize = 60;
}

/// One interactive element as the planner sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub tag: String,
    /// Re-resolvable locator, or a synthetic `kind-index` placeholder.
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aria_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl ElementDescriptor {
    /// Required and still empty.
    pub fn is_unresolved_required(&self) -> bool {
        self.required && self.value.as_deref().map_or(true, |v| v.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDescriptor {
    pub text: String,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub for_id: Option<String>,
}

/// A choice control nested in a modal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropdownDescriptor {
    #[serde(flatten)]
    pub element: ElementDescriptor,
    pub expanded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visible_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalDescriptor {
    #[serde(flatten)]
    pub element: ElementDescriptor,
    pub buttons: Vec<ElementDescriptor>,
    pub inputs: Vec<ElementDescriptor>,
    pub dropdowns: Vec<DropdownDescriptor>,
    pub has_required_fields: bool,
    pub can_auto_dismiss: bool,
}

/// Everything the planner gets to see about the current page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub inputs: Vec<ElementDescriptor>,
    pub textareas: Vec<ElementDescriptor>,
    pub buttons: Vec<ElementDescriptor>,
    pub selects: Vec<ElementDescriptor>,
    pub labels: Vec<LabelDescriptor>,
    pub modals: Vec<ModalDescriptor>,
    pub errors: Vec<String>,
    /// Set by the orchestrator when a verification widget is on screen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeInfo>,
}

impl PageSnapshot {
    /// Total number of element descriptors, modals included.
    pub fn element_count(&self) -> usize {
        self.inputs.len()
            + self.textareas.len()
            + self.buttons.len()
            + self.selects.len()
            + self.labels.len()
            + self.modals.len()
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn non_empty(s: &str, max: usize) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| truncate(s, max))
}

/// Descriptor fields derivable from one measured element.
pub fn describe_element(el: &RawElement, index: usize, kind: &str) -> ElementDescriptor {
    let input_type = el.input_type();
    let value = el.value.as_deref().and_then(|v| {
        if input_type.as_deref() == Some("password") && !v.is_empty() {
            Some("********".to_string())
        } else {
            non_empty(v, limits::VALUE_CHARS)
        }
    });
    let data_attributes = el
        .attributes
        .iter()
        .filter(|(k, _)| k.starts_with("data-"))
        .take(limits::DATA_ATTRS)
        .map(|(k, v)| (k.clone(), truncate(v, limits::DATA_ATTR_CHARS)))
        .collect();
    ElementDescriptor {
        tag: el.tag.clone(),
        selector: generate_selector(el, index, kind),
        id: el.attr("id").map(str::to_string),
        name: el.attr("name").map(str::to_string),
        input_type,
        placeholder: el.attr("placeholder").map(str::to_string),
        aria_label: el.attr("aria-label").map(str::to_string),
        value,
        text: non_empty(&el.text, limits::TEXT_CHARS),
        class_name: el.attr("class").map(|c| truncate(c, limits::CLASS_CHARS)),
        data_attributes,
        disabled: el.disabled,
        required: el.has_attr("required")
            || el.attr("aria-required").is_some_and(|v| v == "true"),
        options: el
            .options
            .iter()
            .filter_map(|o| non_empty(o, limits::TEXT_CHARS))
            .take(limits::OPTIONS)
            .collect(),
    }
}

/// Visible elements matching `selector`, measured, filtered and capped.
async fn visible_elements<D: Dom + ?Sized>(
    dom: &D,
    scope: Option<NodeId>,
    selector: &str,
    cap: usize,
    keep: impl Fn(&RawElement) -> bool,
) -> Vec<(NodeId, RawElement)> {
    let nodes = match dom.query_all(scope, selector).await {
        Ok(nodes) => nodes,
        Err(e) => {
            debug!(selector, error = %e, "snapshot query failed");
            return Vec::new();
        }
    };
    let mut out = Vec::new();
    for node in nodes {
        if out.len() >= cap {
            break;
        }
        match dom.describe(node).await {
            Ok(el) if is_visible(&el) && keep(&el) => out.push((node, el)),
            Ok(_) => {}
            Err(e) => debug!(node = node.0, error = %e, "skipping element"),
        }
    }
    out
}

fn is_field(el: &RawElement) -> bool {
    el.input_type()
        .map_or(true, |t| !BUTTON_INPUT_TYPES.contains(&t.as_str()) && t != "hidden")
}

async fn describe_group<D: Dom + ?Sized>(
    dom: &D,
    scope: Option<NodeId>,
    selector: &str,
    cap: usize,
    kind: &str,
    keep: impl Fn(&RawElement) -> bool,
) -> Vec<ElementDescriptor> {
    visible_elements(dom, scope, selector, cap, keep)
        .await
        .iter()
        .enumerate()
        .map(|(i, (_, el))| describe_element(el, i, kind))
        .collect()
}

/// Option texts of a non-native listbox, either its descendants or the
/// list it points at through `aria-controls`/`aria-owns`.
async fn listbox_options<D: Dom + ?Sized>(
    dom: &D,
    node: NodeId,
    el: &RawElement,
    visible_only: bool,
) -> Vec<String> {
    let owned = el.attr("aria-controls").or_else(|| el.attr("aria-owns"));
    let nodes = match owned {
        Some(id) => {
            let sel = format!("#{} [role=\"option\"], #{} option", css_escape(id), css_escape(id));
            dom.query_all(None, &sel).await
        }
        None => dom.query_all(Some(node), OPTION_SELECTOR).await,
    };
    let mut texts = Vec::new();
    for option in nodes.unwrap_or_default() {
        if texts.len() >= limits::OPTIONS {
            break;
        }
        let Ok(raw) = dom.describe(option).await else {
            continue;
        };
        if visible_only && !is_visible(&raw) {
            continue;
        }
        if let Some(text) = non_empty(&visible_label(&raw), limits::TEXT_CHARS) {
            texts.push(text);
        }
    }
    texts
}

async fn describe_selects<D: Dom + ?Sized>(
    dom: &D,
    scope: Option<NodeId>,
    cap: usize,
    kind: &str,
) -> Vec<(ElementDescriptor, RawElement, NodeId)> {
    let mut out = Vec::new();
    for (i, (node, el)) in visible_elements(dom, scope, SELECT_SELECTOR, cap, |_| true)
        .await
        .into_iter()
        .enumerate()
    {
        let mut desc = describe_element(&el, i, kind);
        if el.tag != "select" && desc.options.is_empty() {
            desc.options = listbox_options(dom, node, &el, false).await;
        }
        out.push((desc, el, node));
    }
    out
}

async fn collect_labels<D: Dom + ?Sized>(dom: &D) -> Vec<LabelDescriptor> {
    let mut labels: Vec<LabelDescriptor> = Vec::new();
    for (_, el) in visible_elements(dom, None, LABEL_SELECTOR, usize::MAX, |_| true).await {
        if labels.len() >= limits::LABELS {
            break;
        }
        let Some(text) = non_empty(&el.text, limits::TEXT_CHARS) else {
            continue;
        };
        if labels.iter().any(|l| l.text == text) {
            continue;
        }
        labels.push(LabelDescriptor {
            text,
            for_id: el.attr("for").map(str::to_string),
        });
    }
    labels
}

async fn collect_errors<D: Dom + ?Sized>(dom: &D) -> Vec<String> {
    let mut errors: Vec<String> = Vec::new();
    for (_, el) in visible_elements(dom, None, ERROR_SELECTOR, usize::MAX, |_| true).await {
        if errors.len() >= limits::ERRORS {
            break;
        }
        if let Some(text) = non_empty(&el.text, limits::ERROR_CHARS) {
            if !errors.contains(&text) {
                errors.push(text);
            }
        }
    }
    errors
}

async fn collect_modals<D: Dom + ?Sized>(dom: &D) -> Vec<ModalDescriptor> {
    let mut modals = Vec::new();
    let mut roots: Vec<NodeId> = Vec::new();
    for (node, el) in visible_elements(dom, None, MODAL_SELECTOR, usize::MAX, |_| true).await {
        if modals.len() >= limits::MODALS {
            break;
        }
        // A `.modal` wrapping a `[role=dialog]` is one modal, not two.
        let mut nested = false;
        for root in &roots {
            if let Ok(inner) = dom.query_all(Some(*root), MODAL_SELECTOR).await {
                nested |= inner.contains(&node);
            }
        }
        if nested {
            continue;
        }
        roots.push(node);
        modals.push(describe_modal(dom, node, &el, modals.len()).await);
    }
    modals
}

async fn describe_modal<D: Dom + ?Sized>(
    dom: &D,
    node: NodeId,
    el: &RawElement,
    index: usize,
) -> ModalDescriptor {
    let cap = limits::MODAL_CHILDREN;
    let buttons = describe_group(dom, Some(node), BUTTON_SELECTOR, cap, "modal-button", |_| true).await;
    let mut inputs =
        describe_group(dom, Some(node), INPUT_SELECTOR, cap, "modal-input", is_field).await;
    let textareas =
        describe_group(dom, Some(node), TEXTAREA_SELECTOR, cap, "modal-textarea", |_| true).await;
    inputs.extend(textareas);
    inputs.truncate(cap);

    let mut dropdowns = Vec::new();
    for (element, raw, select) in describe_selects(dom, Some(node), cap, "modal-select").await {
        let expanded = raw.attr("aria-expanded") == Some("true");
        let visible_options = if expanded {
            listbox_options(dom, select, &raw, true).await
        } else {
            Vec::new()
        };
        dropdowns.push(DropdownDescriptor {
            element,
            expanded,
            visible_options,
        });
    }

    let has_required_fields = inputs.iter().any(ElementDescriptor::is_unresolved_required)
        || dropdowns.iter().any(|d| d.element.is_unresolved_required());
    let can_auto_dismiss = !has_required_fields
        && buttons.iter().any(|b| {
            !b.disabled
                && b.text
                    .as_deref()
                    .or(b.value.as_deref())
                    .or(b.aria_label.as_deref())
                    .is_some_and(is_dismiss_label)
        });

    ModalDescriptor {
        element: describe_element(el, index, "modal"),
        buttons,
        inputs,
        dropdowns,
        has_required_fields,
        can_auto_dismiss,
    }
}

/// Build a fresh snapshot of the page. Outstanding node handles are
/// released first.
pub async fn build_snapshot<D: Dom + ?Sized>(dom: &D) -> Result<PageSnapshot> {
    dom.release_handles().await?;
    let url = dom.url().await?;
    let title = dom.title().await.unwrap_or_default();

    let inputs = describe_group(dom, None, INPUT_SELECTOR, limits::INPUTS, "input", is_field).await;
    let textareas =
        describe_group(dom, None, TEXTAREA_SELECTOR, limits::TEXTAREAS, "textarea", |_| true).await;
    let buttons = describe_group(dom, None, BUTTON_SELECTOR, limits::BUTTONS, "button", |_| true).await;
    let selects = describe_selects(dom, None, limits::SELECTS, "select")
        .await
        .into_iter()
        .map(|(desc, _, _)| desc)
        .collect();
    let labels = collect_labels(dom).await;
    let modals = collect_modals(dom).await;
    let errors = collect_errors(dom).await;

    let snapshot = PageSnapshot {
        url,
        title,
        timestamp: Utc::now(),
        inputs,
        textareas,
        buttons,
        selects,
        labels,
        modals,
        errors,
        challenge: None,
    };
    debug!(
        elements = snapshot.element_count(),
        modals = snapshot.modals.len(),
        errors = snapshot.errors.len(),
        "snapshot built"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::fake::FakeDom;

    fn listing_page() -> FakeDom {
        let dom = FakeDom::new("https://shop.test/sell");
        dom.set_title("Create listing");
        let form = dom.add(None, "form", &[]);
        dom.add_text(Some(form), "label", &[("for", "title")], "Title");
        dom.add(Some(form), "input", &[("id", "title"), ("placeholder", "What are you selling?")]);
        dom.add(Some(form), "input", &[("type", "hidden"), ("name", "csrf")]);
        dom.add(Some(form), "input", &[("type", "password"), ("name", "pin"), ("value", "1234")]);
        dom.add(Some(form), "textarea", &[("name", "description")]);
        let cond = dom.add(Some(form), "select", &[("name", "condition")]);
        dom.set_options(cond, &["New", "Used"]);
        dom.add_text(Some(form), "button", &[("type", "submit"), ("class", "publish")], "Publish");
        dom.add(Some(form), "input", &[("type", "submit"), ("value", "Save draft")]);
        dom
    }

    #[tokio::test]
    async fn groups_are_populated() {
        let dom = listing_page();
        let snap = build_snapshot(&dom).await.unwrap();

        assert_eq!(snap.url, "https://shop.test/sell");
        assert_eq!(snap.title, "Create listing");
        assert_eq!(snap.inputs.len(), 2, "{:?}", snap.inputs);
        assert_eq!(snap.inputs[0].selector, "#title");
        assert_eq!(snap.inputs[1].value.as_deref(), Some("********"));
        assert_eq!(snap.textareas[0].selector, "textarea[name=\"description\"]");
        assert_eq!(snap.selects[0].options, vec!["New", "Used"]);
        assert_eq!(snap.buttons.len(), 2);
        assert_eq!(snap.buttons[0].selector, "button.publish");
        assert_eq!(snap.labels[0].text, "Title");
        assert_eq!(snap.labels[0].for_id.as_deref(), Some("title"));
        assert!(snap.modals.is_empty());
        assert_eq!(snap.element_count(), 7);
        assert_eq!(dom.release_count(), 1);
    }

    #[tokio::test]
    async fn hidden_elements_never_appear() {
        let dom = FakeDom::new("about:blank");
        let wrap = dom.add(None, "div", &[]);
        dom.add(Some(wrap), "input", &[("name", "a")]);
        let faded = dom.add(None, "input", &[("name", "b")]);
        dom.set_opacity(faded, 0.0);
        let collapsed = dom.add(None, "input", &[("name", "c")]);
        dom.set_size(collapsed, 0.0, 0.0);
        dom.hide(wrap);

        let snap = build_snapshot(&dom).await.unwrap();
        assert!(snap.inputs.is_empty());
    }

    #[tokio::test]
    async fn caps_hold() {
        let dom = FakeDom::new("about:blank");
        for i in 0..60 {
            dom.add_text(None, "button", &[], &format!("Button {i}"));
            dom.add_text(None, "label", &[], &format!("Label {i}"));
            dom.add_text(None, "div", &[("class", "error")], &format!("Error {i}"));
        }
        let sel = dom.add(None, "select", &[]);
        let many: Vec<String> = (0..50).map(|i| format!("Option {i}")).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        dom.set_options(sel, &refs);

        let snap = build_snapshot(&dom).await.unwrap();
        assert_eq!(snap.buttons.len(), limits::BUTTONS);
        assert_eq!(snap.labels.len(), limits::LABELS);
        assert_eq!(snap.errors.len(), limits::ERRORS);
        assert_eq!(snap.selects[0].options.len(), limits::OPTIONS);
        assert_eq!(snap.buttons[39].selector, "button-39");
    }

    #[tokio::test]
    async fn labels_and_errors_are_deduplicated() {
        let dom = FakeDom::new("about:blank");
        dom.add_text(None, "label", &[], "Price");
        dom.add_text(None, "span", &[("class", "field-label")], "Price");
        dom.add_text(None, "div", &[("role", "alert")], "Price is required");
        dom.add_text(None, "p", &[("class", "error-message")], "Price is required");
        let long = "x".repeat(500);
        dom.add_text(None, "p", &[("class", "invalid-feedback")], &long);

        let snap = build_snapshot(&dom).await.unwrap();
        assert_eq!(snap.labels.len(), 1);
        assert_eq!(snap.errors.len(), 2);
        assert_eq!(snap.errors[1].chars().count(), limits::ERROR_CHARS);
    }

    #[tokio::test]
    async fn broken_element_is_skipped() {
        let dom = FakeDom::new("about:blank");
        let bad = dom.add(None, "input", &[("name", "bad")]);
        dom.add(None, "input", &[("name", "good")]);
        dom.break_node(bad);

        let snap = build_snapshot(&dom).await.unwrap();
        assert_eq!(snap.inputs.len(), 1);
        assert_eq!(snap.inputs[0].name.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn modal_nested_descriptors() {
        let dom = FakeDom::new("about:blank");
        let wrapper = dom.add(None, "div", &[("class", "modal")]);
        let modal = dom.add(Some(wrapper), "div", &[("role", "dialog"), ("id", "ship")]);
        dom.add(Some(modal), "input", &[("name", "zip"), ("required", "")]);
        let combo = dom.add(
            Some(modal),
            "div",
            &[("role", "combobox"), ("aria-expanded", "true"), ("aria-label", "Carrier")],
        );
        dom.add_text(Some(combo), "div", &[("role", "option")], "USPS");
        let hidden_opt = dom.add_text(Some(combo), "div", &[("role", "option")], "FedEx");
        dom.hide(hidden_opt);
        dom.add_text(Some(modal), "button", &[], "Continue");

        let snap = build_snapshot(&dom).await.unwrap();
        assert_eq!(snap.modals.len(), 1, "nested modal containers merge");
        let m = &snap.modals[0];
        assert_eq!(m.inputs.len(), 1);
        assert_eq!(m.inputs[0].selector, "input[name=\"zip\"]");
        assert_eq!(m.dropdowns.len(), 1);
        assert!(m.dropdowns[0].expanded);
        assert_eq!(m.dropdowns[0].visible_options, vec!["USPS"]);
        assert_eq!(m.buttons[0].selector, "modal-button-0");
        assert!(m.has_required_fields);
        assert!(!m.can_auto_dismiss);
    }

    #[tokio::test]
    async fn dismissable_modal_flags() {
        let dom = FakeDom::new("about:blank");
        let modal = dom.add(None, "div", &[("role", "dialog")]);
        dom.add_text(Some(modal), "p", &[], "We use cookies");
        dom.add_text(Some(modal), "button", &[], "Accept all");

        let snap = build_snapshot(&dom).await.unwrap();
        let m = &snap.modals[0];
        assert!(!m.has_required_fields);
        assert!(m.can_auto_dismiss);
    }

    #[tokio::test]
    async fn rebuilding_unchanged_page_is_stable() {
        let dom = listing_page();
        let first = build_snapshot(&dom).await.unwrap();
        let mut second = build_snapshot(&dom).await.unwrap();
        second.timestamp = first.timestamp;
        assert_eq!(first, second);
    }

    #[test]
    fn serializes_in_wire_shape() {
        let desc = ElementDescriptor {
            tag: "input".into(),
            selector: "#title".into(),
            input_type: Some("text".into()),
            aria_label: Some("Title".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["ariaLabel"], "Title");
        assert!(json.get("required").is_none());
        assert!(json.get("options").is_none());
    }
}
