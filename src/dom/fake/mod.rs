//! In-memory [`Dom`] for tests.
//!
//! Build a tree with [`FakeDom::add`], tweak rendering with [`FakeDom::hide`]
//! and friends, then inspect what the engine did through the recording
//! getters. Layout is fake but deterministic: every element is stacked
//! vertically in document order.
//!
//! Selectors are matched by `scraper`: the tree is written out as markup
//! with one marker attribute per element, parsed back, and matches are
//! mapped to node indices. Rendering and form state stay in side tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

use super::{Dom, DomEvent, FilePayload, NodeId, RawElement, Rect};
use crate::{Error, Result};

/// Attribute carrying the node index in the generated markup.
const MARKER: &str = "data-fake-node";

/// Elements the HTML parser never gives children.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

/// Side effects a click can trigger.
#[derive(Debug, Clone)]
pub enum ClickEffect {
    Hide(NodeId),
    Show(NodeId),
    SetText(NodeId, String),
}

#[derive(Debug, Clone)]
struct FakeNode {
    tag: String,
    attrs: BTreeMap<String, String>,
    text: String,
    value: Option<String>,
    parent: Option<usize>,
    children: Vec<usize>,
    hidden: bool,
    invisible: bool,
    opacity: f64,
    size: (f64, f64),
    options: Vec<String>,
    files: Vec<FilePayload>,
    on_click: Vec<ClickEffect>,
    broken: bool,
}

#[derive(Debug, Default)]
struct State {
    url: String,
    title: String,
    nodes: Vec<FakeNode>,
    events: Vec<(usize, DomEvent)>,
    focused: Option<usize>,
    scroll: (f64, f64),
    scrolled_into_view: Vec<usize>,
    mouse: Vec<(f64, f64)>,
    releases: usize,
}

impl State {
    fn node(&self, id: NodeId) -> Result<&FakeNode> {
        let node = self
            .nodes
            .get(id.0 as usize)
            .ok_or_else(|| Error::Dom(format!("stale node handle {}", id.0)))?;
        if node.broken {
            return Err(Error::Dom(format!("node {} detached", id.0)));
        }
        Ok(node)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut FakeNode> {
        self.node(id)?;
        Ok(&mut self.nodes[id.0 as usize])
    }

    /// Preorder traversal of the whole document.
    fn document_order(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let roots: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].parent.is_none())
            .collect();
        for root in roots {
            self.walk(root, &mut out);
        }
        out
    }

    fn walk(&self, node: usize, out: &mut Vec<usize>) {
        out.push(node);
        for &child in &self.nodes[node].children {
            self.walk(child, out);
        }
    }

    fn ancestors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.nodes[node].parent, move |&p| self.nodes[p].parent)
    }

    fn rendered(&self, node: usize) -> bool {
        !self.nodes[node].hidden && self.ancestors(node).all(|a| !self.nodes[a].hidden)
    }

    fn inner_text(&self, node: usize) -> String {
        let mut parts = Vec::new();
        self.collect_text(node, &mut parts);
        parts.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn collect_text(&self, node: usize, parts: &mut Vec<String>) {
        let n = &self.nodes[node];
        if n.hidden {
            return;
        }
        if !n.text.is_empty() {
            parts.push(n.text.clone());
        }
        for &child in &n.children {
            self.collect_text(child, parts);
        }
    }

    fn record(&mut self, node: usize, event: DomEvent) {
        self.events.push((node, event));
    }

    fn markup(&self) -> String {
        let mut out = String::new();
        for root in (0..self.nodes.len()).filter(|&i| self.nodes[i].parent.is_none()) {
            self.write_markup(root, &mut out);
        }
        out
    }

    fn write_markup(&self, node: usize, out: &mut String) {
        let n = &self.nodes[node];
        out.push_str(&format!("<{} {MARKER}=\"{node}\"", n.tag));
        for (name, value) in &n.attrs {
            let value = value.replace('&', "&amp;").replace('"', "&quot;");
            out.push_str(&format!(" {name}=\"{value}\""));
        }
        out.push('>');
        if VOID_ELEMENTS.contains(&n.tag.as_str()) {
            return;
        }
        for &child in &n.children {
            self.write_markup(child, out);
        }
        out.push_str(&format!("</{}>", n.tag));
    }

    /// Parsed elements by node index. Fails when the parser moved or dropped
    /// a node, since matches would no longer describe this tree.
    fn elements<'h>(&self, html: &'h Html) -> Result<HashMap<usize, ElementRef<'h>>> {
        let mut found = HashMap::with_capacity(self.nodes.len());
        for el in html.tree.nodes().filter_map(ElementRef::wrap) {
            let Some(idx) = marker(&el) else {
                continue;
            };
            let parent = el.parent().and_then(ElementRef::wrap).and_then(|p| marker(&p));
            if parent != self.nodes.get(idx).and_then(|n| n.parent) {
                return Err(Error::Dom(format!(
                    "<{}> node {idx} changes parent when parsed as HTML",
                    self.nodes[idx].tag
                )));
            }
            found.insert(idx, el);
        }
        if found.len() != self.nodes.len() {
            return Err(Error::Dom(format!(
                "{} of {} nodes survive HTML parsing",
                found.len(),
                self.nodes.len()
            )));
        }
        Ok(found)
    }

    /// `candidates` that match `selector`, order preserved.
    fn select(&self, selector: &str, candidates: Vec<usize>) -> Result<Vec<usize>> {
        let selector = Selector::parse(selector)
            .map_err(|e| Error::Dom(format!("invalid selector {selector:?}: {e}")))?;
        let html = Html::parse_document(&self.markup());
        let elements = self.elements(&html)?;
        Ok(candidates
            .into_iter()
            .filter(|i| elements.get(i).is_some_and(|el| selector.matches(el)))
            .collect())
    }
}

fn marker(el: &ElementRef<'_>) -> Option<usize> {
    el.value().attr(MARKER)?.parse().ok()
}

/// In-memory page with real CSS matching and an event log.
#[derive(Debug, Default)]
pub struct FakeDom {
    state: Mutex<State>,
}

impl FakeDom {
    pub fn new(url: &str) -> Self {
        Self {
            state: Mutex::new(State {
                url: url.to_string(),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_title(&self, title: &str) {
        self.state().title = title.to_string();
    }

    pub fn set_url(&self, url: &str) {
        self.state().url = url.to_string();
    }

    /// Append an element. Form controls start with their `value` attribute
    /// as the live value.
    pub fn add(&self, parent: Option<NodeId>, tag: &str, attrs: &[(&str, &str)]) -> NodeId {
        let mut st = self.state();
        let tag = tag.to_ascii_lowercase();
        let attrs: BTreeMap<String, String> = attrs
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect();
        let value = match tag.as_str() {
            "input" | "textarea" | "select" => {
                Some(attrs.get("value").cloned().unwrap_or_default())
            }
            _ if attrs.contains_key("contenteditable") => Some(String::new()),
            _ => None,
        };
        let id = st.nodes.len();
        st.nodes.push(FakeNode {
            tag,
            attrs,
            text: String::new(),
            value,
            parent: parent.map(|p| p.0 as usize),
            children: Vec::new(),
            hidden: false,
            invisible: false,
            opacity: 1.0,
            size: (120.0, 24.0),
            options: Vec::new(),
            files: Vec::new(),
            on_click: Vec::new(),
            broken: false,
        });
        if let Some(p) = parent {
            st.nodes[p.0 as usize].children.push(id);
        }
        NodeId(id as u64)
    }

    /// [`add`](Self::add) plus own text content.
    pub fn add_text(
        &self,
        parent: Option<NodeId>,
        tag: &str,
        attrs: &[(&str, &str)],
        text: &str,
    ) -> NodeId {
        let id = self.add(parent, tag, attrs);
        self.set_text(id, text);
        id
    }

    pub fn set_text(&self, node: NodeId, text: &str) {
        self.state().nodes[node.0 as usize].text = text.to_string();
    }

    pub fn set_attr(&self, node: NodeId, name: &str, value: &str) {
        self.state().nodes[node.0 as usize]
            .attrs
            .insert(name.to_string(), value.to_string());
    }

    /// Option texts of a `<select>`; the first becomes the current value.
    pub fn set_options(&self, node: NodeId, options: &[&str]) {
        let mut st = self.state();
        let n = &mut st.nodes[node.0 as usize];
        n.options = options.iter().map(|o| o.to_string()).collect();
        if n.value.as_deref().map_or(true, str::is_empty) {
            n.value = n.options.first().cloned();
        }
    }

    /// `display: none`.
    pub fn hide(&self, node: NodeId) {
        self.state().nodes[node.0 as usize].hidden = true;
    }

    pub fn show(&self, node: NodeId) {
        self.state().nodes[node.0 as usize].hidden = false;
    }

    /// `visibility: hidden`, inherited by descendants.
    pub fn make_invisible(&self, node: NodeId) {
        self.state().nodes[node.0 as usize].invisible = true;
    }

    pub fn set_opacity(&self, node: NodeId, opacity: f64) {
        self.state().nodes[node.0 as usize].opacity = opacity;
    }

    pub fn set_size(&self, node: NodeId, width: f64, height: f64) {
        self.state().nodes[node.0 as usize].size = (width, height);
    }

    pub fn on_click(&self, node: NodeId, effect: ClickEffect) {
        self.state().nodes[node.0 as usize].on_click.push(effect);
    }

    /// Make every handle operation on `node` fail, as if it were detached
    /// mid-read.
    pub fn break_node(&self, node: NodeId) {
        self.state().nodes[node.0 as usize].broken = true;
    }

    pub fn value(&self, node: NodeId) -> Option<String> {
        self.state().nodes[node.0 as usize].value.clone()
    }

    pub fn is_hidden(&self, node: NodeId) -> bool {
        !self.state().rendered(node.0 as usize)
    }

    /// Events dispatched to `node`, oldest first.
    pub fn events(&self, node: NodeId) -> Vec<DomEvent> {
        self.state()
            .events
            .iter()
            .filter(|(n, _)| *n == node.0 as usize)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Event type names dispatched to `node`, oldest first.
    pub fn event_kinds(&self, node: NodeId) -> Vec<&'static str> {
        self.events(node).iter().map(DomEvent::kind).collect()
    }

    pub fn files(&self, node: NodeId) -> Vec<FilePayload> {
        self.state().nodes[node.0 as usize].files.clone()
    }

    pub fn focused(&self) -> Option<NodeId> {
        self.state().focused.map(|n| NodeId(n as u64))
    }

    pub fn scroll_offset(&self) -> (f64, f64) {
        self.state().scroll
    }

    pub fn scrolled_into_view(&self) -> Vec<NodeId> {
        self.state()
            .scrolled_into_view
            .iter()
            .map(|&n| NodeId(n as u64))
            .collect()
    }

    pub fn mouse_moves(&self) -> Vec<(f64, f64)> {
        self.state().mouse.clone()
    }

    pub fn release_count(&self) -> usize {
        self.state().releases
    }
}

#[async_trait(?Send)]
impl Dom for FakeDom {
    async fn url(&self) -> Result<String> {
        Ok(self.state().url.clone())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.state().title.clone())
    }

    async fn query_all(&self, scope: Option<NodeId>, selector: &str) -> Result<Vec<NodeId>> {
        let st = self.state();
        let candidates = match scope {
            None => st.document_order(),
            Some(scope) => {
                st.node(scope)?;
                let mut under = Vec::new();
                st.walk(scope.0 as usize, &mut under);
                under.remove(0);
                under
            }
        };
        Ok(st
            .select(selector, candidates)?
            .into_iter()
            .map(|n| NodeId(n as u64))
            .collect())
    }

    async fn describe(&self, node: NodeId) -> Result<RawElement> {
        let st = self.state();
        let n = st.node(node)?;
        let idx = node.0 as usize;
        let rendered = st.rendered(idx);
        let invisible = n.invisible || st.ancestors(idx).any(|a| st.nodes[a].invisible);
        let position = st
            .document_order()
            .iter()
            .position(|&i| i == idx)
            .unwrap_or(idx);
        let rect = if rendered {
            Rect {
                x: 0.0,
                y: position as f64 * 30.0,
                width: n.size.0,
                height: n.size.1,
            }
        } else {
            Rect::default()
        };
        Ok(RawElement {
            tag: n.tag.clone(),
            attributes: n.attrs.clone(),
            text: st.inner_text(idx),
            value: n.value.clone(),
            display: if n.hidden { "none" } else { "block" }.into(),
            visibility: if invisible { "hidden" } else { "visible" }.into(),
            opacity: n.opacity,
            rect,
            disabled: n.attrs.contains_key("disabled")
                || n.attrs.get("aria-disabled").map(String::as_str) == Some("true"),
            options: n.options.clone(),
        })
    }

    async fn closest(&self, node: NodeId, selector: &str) -> Result<Option<NodeId>> {
        let st = self.state();
        st.node(node)?;
        let idx = node.0 as usize;
        let chain: Vec<usize> = std::iter::once(idx).chain(st.ancestors(idx)).collect();
        Ok(st
            .select(selector, chain)?
            .first()
            .map(|&n| NodeId(n as u64)))
    }

    async fn focus(&self, node: NodeId) -> Result<()> {
        let mut st = self.state();
        st.node(node)?;
        st.focused = Some(node.0 as usize);
        Ok(())
    }

    async fn set_value(&self, node: NodeId, value: &str) -> Result<()> {
        let mut st = self.state();
        st.node_mut(node)?.value = Some(value.to_string());
        Ok(())
    }

    async fn dispatch(&self, node: NodeId, event: &DomEvent) -> Result<()> {
        let mut st = self.state();
        st.node(node)?;
        let idx = node.0 as usize;
        st.record(idx, event.clone());
        match event {
            DomEvent::Blur if st.focused == Some(idx) => st.focused = None,
            DomEvent::Click => {
                let effects = st.nodes[idx].on_click.clone();
                for effect in effects {
                    match effect {
                        ClickEffect::Hide(t) => st.nodes[t.0 as usize].hidden = true,
                        ClickEffect::Show(t) => st.nodes[t.0 as usize].hidden = false,
                        ClickEffect::SetText(t, text) => st.nodes[t.0 as usize].text = text,
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn select_option(&self, node: NodeId, wanted: &str) -> Result<bool> {
        let mut st = self.state();
        let n = st.node_mut(node)?;
        if n.tag != "select" {
            return Err(Error::Dom("not a select element".into()));
        }
        let w = wanted.trim().to_lowercase();
        let found = n
            .options
            .iter()
            .find(|o| o.trim().to_lowercase() == w)
            .or_else(|| {
                n.options
                    .iter()
                    .find(|o| !w.is_empty() && o.to_lowercase().contains(&w))
            })
            .cloned();
        let Some(opt) = found else {
            return Ok(false);
        };
        n.value = Some(opt);
        let idx = node.0 as usize;
        st.record(idx, DomEvent::Input(None));
        st.record(idx, DomEvent::Change);
        Ok(true)
    }

    async fn scroll_into_view(&self, node: NodeId) -> Result<()> {
        let mut st = self.state();
        st.node(node)?;
        st.scrolled_into_view.push(node.0 as usize);
        Ok(())
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        let mut st = self.state();
        st.scroll.0 += dx;
        st.scroll.1 += dy;
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        self.state().mouse.push((x, y));
        Ok(())
    }

    async fn attach_files(&self, node: NodeId, files: &[FilePayload]) -> Result<()> {
        let mut st = self.state();
        let n = st.node_mut(node)?;
        if n.tag != "input" || n.attrs.get("type").map(String::as_str) != Some("file") {
            return Err(Error::Dom("not a file input".into()));
        }
        n.files = files.to_vec();
        let idx = node.0 as usize;
        st.record(idx, DomEvent::Input(None));
        st.record(idx, DomEvent::Change);
        Ok(())
    }

    async fn release_handles(&self) -> Result<()> {
        self.state().releases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_is_in_document_order_and_scoped() {
        let dom = FakeDom::new("https://shop.test/sell");
        let form = dom.add(None, "form", &[]);
        let a = dom.add(Some(form), "input", &[("name", "a")]);
        let outside = dom.add(None, "input", &[("name", "c")]);
        let b = dom.add(Some(form), "input", &[("name", "b")]);

        let all = dom.query_all(None, "input").await.unwrap();
        assert_eq!(all, vec![a, b, outside]);

        let scoped = dom.query_all(Some(form), "input").await.unwrap();
        assert_eq!(scoped, vec![a, b]);
    }

    #[tokio::test]
    async fn invalid_selector_is_an_error() {
        let dom = FakeDom::new("about:blank");
        dom.add(None, "button", &[]);
        for bad in ["", "button[", "##x", "div >", "a,,b", "[x=\"y]"] {
            assert!(dom.query_all(None, bad).await.is_err(), "accepted {bad:?}");
        }
    }

    /// Dialog with a form holding a submit button and a hidden input, plus
    /// a captcha frame outside it.
    fn dialog_page() -> (FakeDom, NodeId, NodeId, NodeId, NodeId) {
        let dom = FakeDom::new("about:blank");
        let modal = dom.add(None, "div", &[("role", "dialog"), ("class", "modal open")]);
        let form = dom.add(Some(modal), "form", &[]);
        let submit = dom.add(Some(form), "button", &[("type", "submit"), ("class", "btn btn-primary")]);
        let csrf = dom.add(Some(form), "input", &[("type", "hidden"), ("name", "csrf")]);
        let frame = dom.add(None, "iframe", &[("src", "https://www.google.com/recaptcha/api2")]);
        (dom, modal, submit, csrf, frame)
    }

    async fn matches(dom: &FakeDom, selector: &str, node: NodeId) -> bool {
        dom.query_all(None, selector).await.unwrap().contains(&node)
    }

    #[tokio::test]
    async fn compound_selectors_and_combinators() {
        let (dom, modal, submit, _, _) = dialog_page();
        assert!(matches(&dom, "button.btn-primary[type=\"submit\"]", submit).await);
        assert!(matches(&dom, "div.modal.open", modal).await);
        assert!(!matches(&dom, "div.modal.closed", modal).await);
        assert!(matches(&dom, "[role=\"dialog\"] button", submit).await);
        assert!(matches(&dom, "form > button", submit).await);
        assert!(!matches(&dom, "[role=\"dialog\"] > button", submit).await);
        assert!(matches(&dom, ".modal form > button[type=submit]", submit).await);
    }

    #[tokio::test]
    async fn attribute_operators_and_negation() {
        let (dom, _, submit, csrf, frame) = dialog_page();
        assert!(matches(&dom, "iframe[src*=\"recaptcha\"]", frame).await);
        assert!(matches(&dom, "iframe[src^='https://www.google']", frame).await);
        assert!(matches(&dom, "iframe[src$=\"api2\"]", frame).await);
        assert!(matches(&dom, "iframe[src*=\"RECAPTCHA\" i]", frame).await);
        assert!(!matches(&dom, "iframe[src*=\"hcaptcha\"]", frame).await);
        assert!(matches(&dom, "[class~=\"btn\"]", submit).await);
        assert!(!matches(&dom, "input:not([type=\"hidden\"])", csrf).await);
        assert!(matches(&dom, "input:not([type=\"text\"]):not([type=\"submit\"])", csrf).await);
        assert!(matches(&dom, "textarea, input", csrf).await);
    }

    #[tokio::test]
    async fn attribute_values_are_escaped() {
        let dom = FakeDom::new("about:blank");
        let input = dom.add(None, "input", &[("id", "a.b"), ("placeholder", "Say \"hi\" & go")]);
        assert!(matches(&dom, "#a\\.b", input).await);
        assert!(matches(&dom, "[placeholder=\"Say \\\"hi\\\" & go\"]", input).await);
    }

    #[tokio::test]
    async fn closest_includes_self_and_scope_excludes_it() {
        let (dom, modal, submit, _, _) = dialog_page();
        assert_eq!(dom.closest(submit, "button").await.unwrap(), Some(submit));
        assert_eq!(dom.closest(submit, "[role=dialog]").await.unwrap(), Some(modal));
        assert_eq!(dom.closest(submit, "iframe").await.unwrap(), None);
        assert!(dom.query_all(Some(modal), "[role=dialog]").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trees_the_parser_would_rewrite_are_rejected() {
        let dom = FakeDom::new("about:blank");
        let input = dom.add(None, "input", &[]);
        dom.add(Some(input), "span", &[]);
        assert!(dom.query_all(None, "span").await.is_err());
    }

    #[tokio::test]
    async fn hidden_ancestor_zeroes_rect() {
        let dom = FakeDom::new("about:blank");
        let wrap = dom.add(None, "div", &[]);
        let input = dom.add(Some(wrap), "input", &[]);
        assert!(dom.describe(input).await.unwrap().rect.area() > 0.0);

        dom.hide(wrap);
        let el = dom.describe(input).await.unwrap();
        assert_eq!(el.rect.area(), 0.0);
        assert_eq!(el.display, "block");
    }

    #[tokio::test]
    async fn inner_text_skips_hidden_children() {
        let dom = FakeDom::new("about:blank");
        let btn = dom.add_text(None, "button", &[], "Save");
        let badge = dom.add_text(Some(btn), "span", &[], "(draft)");
        assert_eq!(dom.describe(btn).await.unwrap().text, "Save (draft)");
        dom.hide(badge);
        assert_eq!(dom.describe(btn).await.unwrap().text, "Save");
    }

    #[tokio::test]
    async fn click_effects_apply() {
        let dom = FakeDom::new("about:blank");
        let modal = dom.add(None, "div", &[("role", "dialog")]);
        let ok = dom.add_text(Some(modal), "button", &[], "OK");
        dom.on_click(ok, ClickEffect::Hide(modal));

        dom.dispatch(ok, &DomEvent::Click).await.unwrap();
        assert!(dom.is_hidden(modal));
        assert_eq!(dom.event_kinds(ok), vec!["click"]);
    }

    #[tokio::test]
    async fn select_option_matches_text_case_insensitively() {
        let dom = FakeDom::new("about:blank");
        let sel = dom.add(None, "select", &[("name", "condition")]);
        dom.set_options(sel, &["New", "Used - Good", "For parts"]);
        assert_eq!(dom.value(sel).as_deref(), Some("New"));

        assert!(dom.select_option(sel, "used - good").await.unwrap());
        assert_eq!(dom.value(sel).as_deref(), Some("Used - Good"));
        assert!(!dom.select_option(sel, "Refurbished").await.unwrap());
        assert_eq!(dom.event_kinds(sel), vec!["input", "change"]);
    }

    #[tokio::test]
    async fn broken_nodes_fail_reads() {
        let dom = FakeDom::new("about:blank");
        let input = dom.add(None, "input", &[]);
        dom.break_node(input);
        assert!(dom.describe(input).await.is_err());
        assert_eq!(dom.query_all(None, "input").await.unwrap(), vec![input]);
    }
}
