//! [`Dom`] over a live `eoka` page.
//!
//! Elements are kept in a page-side registry (`window.__formpilot`) so Rust
//! can hold plain integer handles between calls. Every script is an arrow
//! function invoked with JSON-encoded arguments.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use eoka::Page;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Dom, DomEvent, FilePayload, NodeId, RawElement};
use crate::{Error, Result};

/// Shared prologue: registry lookup for a handle argument named `id`.
const NODE_PRELUDE: &str = r#"
    const R = (window.__formpilot ||= { nodes: [], ids: new WeakMap() });
    const el = R.nodes[id];
    if (!el || !el.isConnected) return { error: 'stale node handle ' + id };
"#;

const QUERY_ALL_JS: &str = r#"(scopeId, sel) => {
    const R = (window.__formpilot ||= { nodes: [], ids: new WeakMap() });
    const root = scopeId === null ? document : R.nodes[scopeId];
    if (!root || (root !== document && !root.isConnected)) return { error: 'stale scope handle' };
    let found;
    try { found = root.querySelectorAll(sel); } catch (e) { return { error: 'invalid selector: ' + e.message }; }
    const ids = [];
    for (const el of found) {
        let id = R.ids.get(el);
        if (id === undefined) { id = R.nodes.push(el) - 1; R.ids.set(el, id); }
        ids.push(id);
    }
    return { ids };
}"#;

const CLOSEST_JS: &str = r#"(id, sel) => {
    __PRELUDE__
    let match;
    try { match = el.closest(sel); } catch (e) { return { error: 'invalid selector: ' + e.message }; }
    if (!match) return { ids: [] };
    let mid = R.ids.get(match);
    if (mid === undefined) { mid = R.nodes.push(match) - 1; R.ids.set(match, mid); }
    return { ids: [mid] };
}"#;

const DESCRIBE_JS: &str = r#"(id) => {
    __PRELUDE__
    const cs = getComputedStyle(el);
    const r = el.getBoundingClientRect();
    const attributes = {};
    for (const a of el.attributes) attributes[a.name] = a.value;
    const tag = el.tagName.toLowerCase();
    const text = (el.innerText ?? el.textContent ?? '').replace(/\s+/g, ' ').trim().slice(0, 400);
    const opacity = parseFloat(cs.opacity);
    return { element: {
        tag,
        attributes,
        text,
        value: typeof el.value === 'string' ? el.value : (el.isContentEditable ? el.textContent : null),
        display: cs.display,
        visibility: cs.visibility,
        opacity: Number.isFinite(opacity) ? opacity : 1,
        rect: { x: r.x, y: r.y, width: r.width, height: r.height },
        disabled: !!el.disabled || el.getAttribute('aria-disabled') === 'true',
        options: tag === 'select' ? Array.from(el.options).map(o => o.text.trim()) : [],
    } };
}"#;

const FOCUS_JS: &str = r#"(id) => {
    __PRELUDE__
    el.focus({ preventScroll: true });
    return { ok: true };
}"#;

const SET_VALUE_JS: &str = r#"(id, value) => {
    __PRELUDE__
    if (el.isContentEditable) { el.textContent = value; return { ok: true }; }
    const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
        : el instanceof HTMLSelectElement ? HTMLSelectElement.prototype
        : HTMLInputElement.prototype;
    const setter = Object.getOwnPropertyDescriptor(proto, 'value')?.set;
    if (setter) setter.call(el, value); else el.value = value;
    return { ok: true };
}"#;

const DISPATCH_JS: &str = r#"(id, kind, key) => {
    __PRELUDE__
    const r = el.getBoundingClientRect();
    const mouse = { bubbles: true, cancelable: true, view: window, button: 0,
        clientX: r.x + r.width / 2, clientY: r.y + r.height / 2 };
    let ev;
    switch (kind) {
        case 'input':
            ev = new InputEvent('input', { bubbles: true, inputType: key === null ? 'deleteContentBackward' : 'insertText', data: key });
            break;
        case 'change':
            ev = new Event('change', { bubbles: true });
            break;
        case 'blur':
            if (document.activeElement === el) { el.blur(); return { ok: true }; }
            ev = new FocusEvent('blur');
            break;
        case 'keydown':
        case 'keyup':
            ev = new KeyboardEvent(kind, { bubbles: true, cancelable: true, key });
            break;
        default:
            ev = new MouseEvent(kind, mouse);
    }
    el.dispatchEvent(ev);
    return { ok: true };
}"#;

const SELECT_OPTION_JS: &str = r#"(id, wanted) => {
    __PRELUDE__
    if (el.tagName !== 'SELECT') return { error: 'not a select element' };
    const norm = s => (s || '').trim().toLowerCase();
    const w = norm(wanted);
    const opts = Array.from(el.options);
    const opt = opts.find(o => o.value === wanted || norm(o.text) === w)
        || opts.find(o => w && norm(o.text).includes(w));
    if (!opt) return { ok: false };
    const setter = Object.getOwnPropertyDescriptor(HTMLSelectElement.prototype, 'value')?.set;
    if (setter) setter.call(el, opt.value); else el.value = opt.value;
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return { ok: true };
}"#;

const SCROLL_INTO_VIEW_JS: &str = r#"(id) => {
    __PRELUDE__
    el.scrollIntoView({ behavior: 'instant', block: 'center' });
    return { ok: true };
}"#;

const ATTACH_FILES_JS: &str = r#"(id, files) => {
    __PRELUDE__
    if (el.tagName !== 'INPUT' || el.type !== 'file') return { error: 'not a file input' };
    const dt = new DataTransfer();
    for (const f of files) {
        const bin = atob(f.data);
        const bytes = new Uint8Array(bin.length);
        for (let i = 0; i < bin.length; i++) bytes[i] = bin.charCodeAt(i);
        dt.items.add(new File([bytes], f.name, { type: f.mime }));
    }
    el.files = dt.files;
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return { ok: true };
}"#;

const RELEASE_JS: &str = "window.__formpilot = { nodes: [], ids: new WeakMap() }";

#[derive(Deserialize)]
struct HandlesReply {
    #[serde(default)]
    ids: Vec<u64>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct DescribeReply {
    element: Option<RawElement>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct Ack {
    #[serde(default)]
    ok: bool,
    error: Option<String>,
}

impl Ack {
    fn into_result(self) -> Result<bool> {
        match self.error {
            Some(e) => Err(Error::Dom(e)),
            None => Ok(self.ok),
        }
    }
}

/// [`Dom`] implementation backed by an `eoka` [`Page`].
pub struct PageDom<'a> {
    page: &'a Page,
}

impl<'a> PageDom<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self { page }
    }

    /// Invoke one of the arrow-function scripts above with JSON arguments.
    async fn call<T: DeserializeOwned>(&self, func: &str, args: &[Value]) -> Result<T> {
        let mut encoded = Vec::with_capacity(args.len());
        for arg in args {
            encoded.push(serde_json::to_string(arg)?);
        }
        let js = format!(
            "({})({})",
            func.replace("__PRELUDE__", NODE_PRELUDE),
            encoded.join(",")
        );
        Ok(self.page.evaluate(&js).await?)
    }

    async fn ack(&self, func: &str, args: &[Value]) -> Result<bool> {
        let reply: Ack = self.call(func, args).await?;
        reply.into_result()
    }
}

#[async_trait(?Send)]
impl Dom for PageDom<'_> {
    async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?)
    }

    async fn title(&self) -> Result<String> {
        Ok(self.page.title().await?)
    }

    async fn query_all(&self, scope: Option<NodeId>, selector: &str) -> Result<Vec<NodeId>> {
        let reply: HandlesReply = self
            .call(QUERY_ALL_JS, &[json!(scope.map(|n| n.0)), json!(selector)])
            .await?;
        if let Some(e) = reply.error {
            return Err(Error::Dom(e));
        }
        Ok(reply.ids.into_iter().map(NodeId).collect())
    }

    async fn describe(&self, node: NodeId) -> Result<RawElement> {
        let reply: DescribeReply = self.call(DESCRIBE_JS, &[json!(node.0)]).await?;
        match (reply.element, reply.error) {
            (Some(el), None) => Ok(el),
            (_, Some(e)) => Err(Error::Dom(e)),
            (None, None) => Err(Error::Dom(format!("empty describe reply for {}", node.0))),
        }
    }

    async fn closest(&self, node: NodeId, selector: &str) -> Result<Option<NodeId>> {
        let reply: HandlesReply = self
            .call(CLOSEST_JS, &[json!(node.0), json!(selector)])
            .await?;
        if let Some(e) = reply.error {
            return Err(Error::Dom(e));
        }
        Ok(reply.ids.first().copied().map(NodeId))
    }

    async fn focus(&self, node: NodeId) -> Result<()> {
        self.ack(FOCUS_JS, &[json!(node.0)]).await.map(|_| ())
    }

    async fn set_value(&self, node: NodeId, value: &str) -> Result<()> {
        self.ack(SET_VALUE_JS, &[json!(node.0), json!(value)])
            .await
            .map(|_| ())
    }

    async fn dispatch(&self, node: NodeId, event: &DomEvent) -> Result<()> {
        self.ack(
            DISPATCH_JS,
            &[json!(node.0), json!(event.kind()), json!(event.key())],
        )
        .await
        .map(|_| ())
    }

    async fn select_option(&self, node: NodeId, wanted: &str) -> Result<bool> {
        self.ack(SELECT_OPTION_JS, &[json!(node.0), json!(wanted)])
            .await
    }

    async fn scroll_into_view(&self, node: NodeId) -> Result<()> {
        self.ack(SCROLL_INTO_VIEW_JS, &[json!(node.0)])
            .await
            .map(|_| ())
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        self.page
            .execute(&format!("window.scrollBy({dx}, {dy})"))
            .await?;
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        self.page
            .session()
            .dispatch_mouse_event(eoka::cdp::MouseEventType::MouseMoved, x, y, None, None)
            .await?;
        Ok(())
    }

    async fn attach_files(&self, node: NodeId, files: &[FilePayload]) -> Result<()> {
        let payload: Vec<Value> = files
            .iter()
            .map(|f| json!({ "name": f.name, "mime": f.mime, "data": BASE64.encode(&f.bytes) }))
            .collect();
        self.ack(ATTACH_FILES_JS, &[json!(node.0), Value::Array(payload)])
            .await
            .map(|_| ())
    }

    async fn release_handles(&self) -> Result<()> {
        self.page.execute(RELEASE_JS).await?;
        Ok(())
    }
}
