use std::time::Duration;

use tracing::{debug, info};

use crate::dom::{Dom, NodeId};
use crate::executor::Executor;
use crate::inspect::{is_visible, visible_label, Located};
use crate::observe::MODAL_SELECTOR;

/// Pause after clicking a modal button.
pub const MODAL_SETTLE: Duration = Duration::from_millis(500);

/// Primary-action buttons inside open modals, most specific first.
pub const PRIMARY_BUTTON_PATTERNS: &[&str] = &[
    "[role=\"dialog\"] button[type=\"submit\"]",
    "[role=\"dialog\"] button.btn-primary",
    "[role=\"dialog\"] button[class*=\"primary\"]",
    "[role=\"alertdialog\"] button[class*=\"primary\"]",
    "[aria-modal=\"true\"] button[class*=\"primary\"]",
    ".modal button.btn-primary",
    ".modal button[class*=\"primary\"]",
    "dialog[open] button[class*=\"primary\"]",
    "[role=\"dialog\"] [data-testid*=\"accept\" i]",
    "[role=\"dialog\"] [data-testid*=\"confirm\" i]",
    "[role=\"dialog\"] button[aria-label*=\"close\" i]",
    "[aria-modal=\"true\"] button[aria-label*=\"close\" i]",
    ".modal button[class*=\"close\"]",
];

/// Any button inside an open modal; clicked only if its label dismisses.
const MODAL_BUTTONS: &str = "[role=\"dialog\"] button, [role=\"alertdialog\"] button, \
    [aria-modal=\"true\"] button, .modal button, dialog[open] button, \
    [role=\"dialog\"] [role=\"button\"], .modal [role=\"button\"]";

const DISMISS_LABELS: &[&str] = &[
    "ok",
    "okay",
    "got it",
    "accept",
    "agree",
    "i agree",
    "allow all",
    "continue",
    "confirm",
    "done",
    "close",
    "dismiss",
    "skip",
    "no thanks",
    "not now",
    "maybe later",
    "×",
    "✕",
];

/// Whether a button label reads like it closes or acknowledges a modal.
pub fn is_dismiss_label(label: &str) -> bool {
    let label = label.trim().to_lowercase();
    DISMISS_LABELS
        .iter()
        .any(|l| label == *l || label.starts_with(&format!("{} ", l)))
}

/// Visible required fields in `modal` that are still empty.
async fn has_unresolved_required<D: Dom + ?Sized>(dom: &D, modal: NodeId) -> bool {
    let Ok(fields) = dom.query_all(Some(modal), "input, textarea, select").await else {
        return false;
    };
    for field in fields {
        let Ok(el) = dom.describe(field).await else {
            continue;
        };
        let required = el.has_attr("required") || el.attr("aria-required") == Some("true");
        let empty = el.value.as_deref().map_or(true, |v| v.trim().is_empty());
        if required && empty && is_visible(&el) {
            return true;
        }
    }
    false
}

/// A visible, enabled button whose modal has nothing left to fill in.
async fn clickable<D: Dom + ?Sized>(dom: &D, node: NodeId) -> Option<Located> {
    let element = dom.describe(node).await.ok()?;
    if !is_visible(&element) || element.disabled {
        return None;
    }
    if let Ok(Some(modal)) = dom.closest(node, MODAL_SELECTOR).await {
        if has_unresolved_required(dom, modal).await {
            debug!(node = node.0, "modal has unresolved required fields, leaving it");
            return None;
        }
    }
    Some(Located { node, element })
}

async fn primary_button<D: Dom + ?Sized>(dom: &D) -> Option<(Located, &'static str)> {
    for pattern in PRIMARY_BUTTON_PATTERNS {
        let Ok(nodes) = dom.query_all(None, pattern).await else {
            continue;
        };
        for node in nodes {
            if let Some(found) = clickable(dom, node).await {
                return Some((found, *pattern));
            }
        }
    }
    let nodes = dom.query_all(None, MODAL_BUTTONS).await.ok()?;
    for node in nodes {
        if let Some(found) = clickable(dom, node).await {
            if is_dismiss_label(&visible_label(&found.element)) {
                return Some((found, "dismiss label"));
            }
        }
    }
    None
}

/// Click the primary button of the first open modal that can be
/// dismissed, then wait for it to settle. Returns whether one was handled.
pub async fn handle_modal<D: Dom + ?Sized>(dom: &D, executor: &Executor) -> bool {
    let Some((button, matched)) = primary_button(dom).await else {
        return false;
    };
    let label = visible_label(&button.element);
    if let Err(e) = executor.click_element(dom, &button).await {
        debug!(error = %e, "modal button click failed");
        return false;
    }
    info!(button = %label, pattern = matched, "dismissed modal");
    tokio::time::sleep(MODAL_SETTLE).await;
    true
}

/// Handle modals until none is left or `max_attempts` is reached, pausing
/// `interval` between attempts. Returns how many were handled.
pub async fn dismiss_modals<D: Dom + ?Sized>(
    dom: &D,
    executor: &Executor,
    max_attempts: u32,
    interval: Duration,
) -> u32 {
    let mut dismissed = 0;
    for attempt in 0..max_attempts {
        if attempt > 0 {
            tokio::time::sleep(interval).await;
        }
        if !handle_modal(dom, executor).await {
            break;
        }
        dismissed += 1;
    }
    dismissed
}
