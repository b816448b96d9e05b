//! Element inspection: visibility, stable selector synthesis, lookup.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::dom::{Dom, NodeId, RawElement};

/// Custom attributes test suites put on elements, most specific first.
pub const TEST_ATTRIBUTES: &[&str] = &[
    "data-testid",
    "data-test-id",
    "data-test",
    "data-cy",
    "data-qa",
    "data-automation-id",
    "data-e2e",
];

/// Interactive elements searched by [`find_element_by_text`] by default.
pub const CLICKABLE_SELECTORS: &[&str] = &[
    "button",
    "a",
    "[role=\"button\"]",
    "[role=\"option\"]",
    "[role=\"menuitem\"]",
    "[role=\"tab\"]",
    "input[type=\"submit\"]",
    "input[type=\"button\"]",
    "label",
];

/// Input types that accept typed text.
const TEXT_INPUT_TYPES: &[&str] = &[
    "text", "email", "password", "search", "tel", "url", "number",
];

static SYNTHETIC_SELECTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]+(-[a-z]+)*-\d+$").expect("static regex")
});

/// Layout and state utilities that say nothing about what an element is.
static STRUCTURAL_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^(?:
            active|show|open|hidden|visible|disabled|selected|focus(?:ed)?|hover|
            container(?:-fluid)?|row|col|wrapper|clearfix|flex|grid|block|inline|
            relative|absolute|fixed|sr-only|
            (?:col|d|m[trblxy]?|p[trblxy]?|w|h|gap|text|bg|border|rounded|shadow|
               justify|items|align|self|order|z|top|left|right|bottom)-[\w-]+
        )$",
    )
    .expect("static regex")
});

/// Build-tool output: CSS-in-JS prefixes, module hashes, digit-bearing blobs.
static GENERATED_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:css|sc|jsx|emotion|styled|svelte)-|__[A-Za-z0-9_-]{4,}$|^[A-Za-z_]*\d[A-Za-z0-9_]{3,}$")
        .expect("static regex")
});

/// True only if the element is rendered and takes up space.
pub fn is_visible(el: &RawElement) -> bool {
    el.display != "none"
        && el.visibility != "hidden"
        && el.visibility != "collapse"
        && el.opacity > 0.0
        && el.rect.area() > 0.0
}

/// Whether `selector` is a `kind-index` placeholder rather than a locator.
pub fn is_synthetic_selector(selector: &str) -> bool {
    SYNTHETIC_SELECTOR.is_match(selector)
}

/// Whether typed characters would land in this element.
pub fn is_text_editable(el: &RawElement) -> bool {
    if el.disabled || el.has_attr("readonly") {
        return false;
    }
    match el.tag.as_str() {
        "textarea" => true,
        "input" => el
            .input_type()
            .is_some_and(|t| TEXT_INPUT_TYPES.contains(&t.as_str())),
        _ => el
            .attributes
            .get("contenteditable")
            .is_some_and(|v| !v.eq_ignore_ascii_case("false")),
    }
}

fn is_meaningful_class(class: &str) -> bool {
    !class.contains(':') && !STRUCTURAL_CLASS.is_match(class) && !GENERATED_CLASS.is_match(class)
}

/// Synthesize a selector for `el`, the `index`-th element of its `kind`.
///
/// Precedence: `#id`, a known test attribute, placeholder, name, up to two
/// meaningful classes, and finally the synthetic `kind-index`.
pub fn generate_selector(el: &RawElement, index: usize, kind: &str) -> String {
    if let Some(id) = el.attr("id") {
        return format!("#{}", css_escape(id));
    }
    for attr in TEST_ATTRIBUTES {
        if let Some(v) = el.attr(attr) {
            return format!("[{attr}={}]", css_quote(v));
        }
    }
    if let Some(p) = el.attr("placeholder") {
        return format!("{}[placeholder={}]", el.tag, css_quote(p));
    }
    if let Some(n) = el.attr("name") {
        return format!("{}[name={}]", el.tag, css_quote(n));
    }
    let classes: Vec<String> = el
        .attr("class")
        .unwrap_or("")
        .split_whitespace()
        .filter(|c| is_meaningful_class(c))
        .take(2)
        .map(css_escape)
        .collect();
    if !classes.is_empty() {
        return format!("{}.{}", el.tag, classes.join("."));
    }
    format!("{kind}-{index}")
}

/// Escape an identifier for use after `#` or `.`.
pub fn css_escape(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len());
    let chars: Vec<char> = ident.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        let leading_digit = c.is_ascii_digit() && (i == 0 || (i == 1 && chars[0] == '-'));
        if leading_digit {
            out.push_str(&format!("\\{:x} ", c as u32));
        } else if c.is_ascii_alphanumeric() || c == '-' || c == '_' || !c.is_ascii() {
            out.push(c);
        } else if c.is_ascii_control() {
            out.push_str(&format!("\\{:x} ", c as u32));
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    if out == "-" {
        return "\\-".into();
    }
    out
}

/// Double-quoted CSS string literal.
pub fn css_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\a "),
            '\r' => out.push_str("\\d "),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// An element resolved on the live page, measured at lookup time.
#[derive(Debug, Clone)]
pub struct Located {
    pub node: NodeId,
    pub element: RawElement,
}

/// Resolve a planner-supplied selector.
///
/// Synthetic placeholders and invalid syntax resolve to nothing; lookup
/// errors are swallowed. Among several matches the first visible one wins,
/// then the first match.
pub async fn find_element<D: Dom + ?Sized>(dom: &D, selector: &str) -> Option<Located> {
    let selector = selector.trim();
    if selector.is_empty() || is_synthetic_selector(selector) {
        return None;
    }
    let nodes = match dom.query_all(None, selector).await {
        Ok(nodes) => nodes,
        Err(e) => {
            debug!(selector, error = %e, "selector did not resolve");
            return None;
        }
    };
    let mut first = None;
    for node in nodes {
        let Ok(element) = dom.describe(node).await else {
            continue;
        };
        if is_visible(&element) {
            return Some(Located { node, element });
        }
        first.get_or_insert(Located { node, element });
    }
    first
}

/// Text a user would read on the element: rendered text, else a button
/// input's value, else its aria-label.
pub fn visible_label(el: &RawElement) -> String {
    if !el.text.trim().is_empty() {
        return el.text.trim().to_string();
    }
    if el.tag == "input" {
        if let Some(v) = el.value.as_deref().filter(|v| !v.trim().is_empty()) {
            return v.trim().to_string();
        }
    }
    el.attr("aria-label").unwrap_or("").to_string()
}

/// First visible element under `scope` matching `selector` whose label
/// equals or contains `target`.
async fn first_labelled<D: Dom + ?Sized>(
    dom: &D,
    scope: Option<NodeId>,
    selector: &str,
    target: &str,
) -> Option<Located> {
    let nodes = match dom.query_all(scope, selector).await {
        Ok(nodes) => nodes,
        Err(e) => {
            debug!(error = %e, "text lookup query failed");
            return None;
        }
    };
    for node in nodes {
        let Ok(element) = dom.describe(node).await else {
            continue;
        };
        if !is_visible(&element) {
            continue;
        }
        let label = visible_label(&element).to_lowercase();
        if !label.is_empty() && (label == target || label.contains(target)) {
            return Some(Located { node, element });
        }
    }
    None
}

/// First visible element whose normalized text equals or contains `text`,
/// in document order. When a matching candidate wraps another matching
/// candidate, the innermost one wins, so `<label><button>Next</button></label>`
/// resolves to the button.
pub async fn find_element_by_text<D: Dom + ?Sized>(
    dom: &D,
    text: &str,
    candidates: Option<&[&str]>,
) -> Option<Located> {
    let target = text.trim().to_lowercase();
    if target.is_empty() {
        return None;
    }
    let selector = candidates.unwrap_or(CLICKABLE_SELECTORS).join(", ");
    let mut found = first_labelled(dom, None, &selector, &target).await?;
    while let Some(inner) = first_labelled(dom, Some(found.node), &selector, &target).await {
        found = inner;
    }
    Some(found)
}
