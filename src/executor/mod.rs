//! Action executor: performs one validated action against the live page.
//!
//! Every outcome is a value. Unresolvable elements, DOM errors and failed
//! downloads come back as [`ActionOutcome::Failed`] so the loop can record
//! them and let the planner adapt.

mod upload;

pub use upload::{parse_image_urls, ImageFetcher};

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::action::{Action, ActionKind};
use crate::config::EngineConfig;
use crate::dom::{Dom, DomEvent};
use crate::inspect::{find_element, find_element_by_text, is_text_editable, is_visible, Located};
use crate::timing::DelayPolicy;
use crate::Result;

/// Elements searched when picking an option from a custom dropdown.
const OPTION_CANDIDATES: &[&str] = &[
    "[role=\"option\"]",
    "[role=\"menuitem\"]",
    "[role=\"menuitemradio\"]",
    "option",
    "li",
];

/// Result of executing one action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Succeeded,
    Failed(String),
    /// The planner declared the task complete.
    Done,
    /// The planner gave up; carries its description.
    Error(String),
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Succeeded | ActionOutcome::Done)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionOutcome::Done | ActionOutcome::Error(_))
    }

    /// Failure reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ActionOutcome::Failed(r) | ActionOutcome::Error(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Succeeded => f.write_str("ok"),
            ActionOutcome::Failed(r) => write!(f, "failed: {}", r),
            ActionOutcome::Done => f.write_str("done"),
            ActionOutcome::Error(r) => write!(f, "error: {}", r),
        }
    }
}

/// Executes actions with human-plausible timing.
pub struct Executor {
    timing: Arc<dyn DelayPolicy>,
    images: ImageFetcher,
    scroll_step: f64,
    default_wait: Duration,
    mouse_paths: bool,
    cursor: Mutex<(f64, f64)>,
}

impl Executor {
    pub fn new(config: &EngineConfig, timing: Arc<dyn DelayPolicy>) -> Result<Self> {
        Ok(Self {
            timing,
            images: ImageFetcher::new(&config.uploads)?,
            scroll_step: config.engine.scroll_step_px,
            default_wait: Duration::from_millis(config.engine.default_wait_ms),
            mouse_paths: config.engine.mouse_paths,
            cursor: Mutex::new((0.0, 0.0)),
        })
    }

    /// Execute one action, then wait its `waitMs` if it asked for one.
    pub async fn execute<D: Dom + ?Sized>(&self, dom: &D, action: &Action) -> ActionOutcome {
        debug!(kind = %action.kind, selector = ?action.selector, "executing: {}", action.description);
        let outcome = match action.kind {
            ActionKind::Type => self.type_text(dom, action).await,
            ActionKind::Click => self.click(dom, action).await,
            ActionKind::Select => self.select(dom, action).await,
            ActionKind::Upload => self.upload(dom, action).await,
            ActionKind::Scroll => self.scroll(dom, action).await,
            ActionKind::Wait => {
                let wait = action
                    .wait_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.default_wait);
                tokio::time::sleep(wait).await;
                return ActionOutcome::Succeeded;
            }
            ActionKind::Done => return ActionOutcome::Done,
            ActionKind::Error => return ActionOutcome::Error(action.description.clone()),
        };
        if let Some(ms) = action.wait_ms.filter(|ms| *ms > 0) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        outcome
    }

    /// Resolve the action's selector to a visible element.
    async fn target<D: Dom + ?Sized>(
        &self,
        dom: &D,
        action: &Action,
    ) -> std::result::Result<Located, ActionOutcome> {
        let Some(ref selector) = action.selector else {
            return Err(ActionOutcome::Failed(format!(
                "{} action has no selector",
                action.kind
            )));
        };
        match find_element(dom, selector).await {
            Some(found) if is_visible(&found.element) => Ok(found),
            Some(_) => Err(ActionOutcome::Failed(format!("{} is not visible", selector))),
            None => Err(ActionOutcome::Failed(format!("no element matches {}", selector))),
        }
    }

    async fn type_text<D: Dom + ?Sized>(&self, dom: &D, action: &Action) -> ActionOutcome {
        let target = match self.target(dom, action).await {
            Ok(t) => t,
            Err(outcome) => return outcome,
        };
        if !is_text_editable(&target.element) {
            return ActionOutcome::Failed(format!(
                "<{}> at {} does not accept text",
                target.element.tag,
                action.selector.as_deref().unwrap_or_default()
            ));
        }
        let text = action.value.as_deref().unwrap_or_default();
        match self.type_into(dom, &target, text).await {
            Ok(()) => ActionOutcome::Succeeded,
            Err(e) => ActionOutcome::Failed(e.to_string()),
        }
    }

    /// Focus, clear, then type `text` one character at a time.
    async fn type_into<D: Dom + ?Sized>(&self, dom: &D, target: &Located, text: &str) -> Result<()> {
        let node = target.node;
        dom.focus(node).await?;
        if target.element.value.as_deref().is_some_and(|v| !v.is_empty()) {
            dom.set_value(node, "").await?;
            dom.dispatch(node, &DomEvent::Input(None)).await?;
        }
        let mut typed = String::with_capacity(text.len());
        for c in text.chars() {
            let key = c.to_string();
            dom.dispatch(node, &DomEvent::KeyDown(key.clone())).await?;
            typed.push(c);
            dom.set_value(node, &typed).await?;
            dom.dispatch(node, &DomEvent::Input(Some(key.clone()))).await?;
            dom.dispatch(node, &DomEvent::KeyUp(key)).await?;
            tokio::time::sleep(self.timing.keystroke()).await;
        }
        dom.dispatch(node, &DomEvent::Change).await?;
        dom.dispatch(node, &DomEvent::Blur).await?;
        Ok(())
    }

    async fn click<D: Dom + ?Sized>(&self, dom: &D, action: &Action) -> ActionOutcome {
        let by_selector = match action.selector {
            Some(ref s) => find_element(dom, s).await.filter(|f| is_visible(&f.element)),
            None => None,
        };
        let target = match by_selector {
            Some(t) => t,
            None => match action.value {
                Some(ref text) => match find_element_by_text(dom, text, None).await {
                    Some(t) => t,
                    None => {
                        return ActionOutcome::Failed(format!("nothing to click labelled {:?}", text))
                    }
                },
                None => {
                    return ActionOutcome::Failed(format!(
                        "no element matches {}",
                        action.selector.as_deref().unwrap_or("(no selector)")
                    ))
                }
            },
        };
        if target.element.disabled {
            return ActionOutcome::Failed("target is disabled".into());
        }
        match self.click_element(dom, &target).await {
            Ok(()) => ActionOutcome::Succeeded,
            Err(e) => ActionOutcome::Failed(e.to_string()),
        }
    }

    /// Scroll into view, approach with the mouse, hover, then press and
    /// release.
    pub async fn click_element<D: Dom + ?Sized>(&self, dom: &D, target: &Located) -> Result<()> {
        let node = target.node;
        dom.scroll_into_view(node).await?;
        let center = dom
            .describe(node)
            .await
            .map(|el| el.rect.center())
            .unwrap_or_else(|_| target.element.rect.center());

        if self.mouse_paths {
            let from = *self.cursor.lock().unwrap_or_else(|e| e.into_inner());
            for (x, y) in self.timing.mouse_path(from, center) {
                dom.move_mouse(x, y).await?;
                tokio::time::sleep(self.timing.mouse_step()).await;
            }
            *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = center;
        }

        dom.dispatch(node, &DomEvent::MouseOver).await?;
        tokio::time::sleep(self.timing.pre_click()).await;
        dom.dispatch(node, &DomEvent::MouseDown).await?;
        dom.dispatch(node, &DomEvent::MouseUp).await?;
        dom.dispatch(node, &DomEvent::Click).await?;
        Ok(())
    }

    async fn select<D: Dom + ?Sized>(&self, dom: &D, action: &Action) -> ActionOutcome {
        let target = match self.target(dom, action).await {
            Ok(t) => t,
            Err(outcome) => return outcome,
        };
        let Some(ref wanted) = action.value else {
            return ActionOutcome::Failed("select action has no value".into());
        };

        if target.element.tag == "select" {
            return match dom.select_option(target.node, wanted).await {
                Ok(true) => ActionOutcome::Succeeded,
                Ok(false) => ActionOutcome::Failed(format!("no option matching {:?}", wanted)),
                Err(e) => ActionOutcome::Failed(e.to_string()),
            };
        }

        // Custom dropdown: open it, let it render, click the option.
        if let Err(e) = self.click_element(dom, &target).await {
            return ActionOutcome::Failed(e.to_string());
        }
        tokio::time::sleep(self.timing.settle()).await;
        let Some(option) = find_element_by_text(dom, wanted, Some(OPTION_CANDIDATES)).await else {
            return ActionOutcome::Failed(format!("dropdown has no option {:?}", wanted));
        };
        match self.click_element(dom, &option).await {
            Ok(()) => ActionOutcome::Succeeded,
            Err(e) => ActionOutcome::Failed(e.to_string()),
        }
    }

    async fn upload<D: Dom + ?Sized>(&self, dom: &D, action: &Action) -> ActionOutcome {
        let urls = parse_image_urls(action.value.as_deref().unwrap_or_default(), self.images.max_images());
        if urls.is_empty() {
            return ActionOutcome::Failed("upload action has no image URLs".into());
        }
        let Some(input) = upload::file_input(dom, action.selector.as_deref()).await else {
            return ActionOutcome::Failed("no file input on the page".into());
        };
        let files = self.images.fetch_all(&urls).await;
        if files.is_empty() {
            return ActionOutcome::Failed(format!(
                "none of {} image(s) could be fetched",
                urls.len()
            ));
        }
        info!(fetched = files.len(), requested = urls.len(), "attaching images");
        match dom.attach_files(input, &files).await {
            Ok(()) => ActionOutcome::Succeeded,
            Err(e) => ActionOutcome::Failed(e.to_string()),
        }
    }

    async fn scroll<D: Dom + ?Sized>(&self, dom: &D, action: &Action) -> ActionOutcome {
        let target = match action.selector {
            Some(ref s) => find_element(dom, s).await,
            None => None,
        };
        let result = match target {
            Some(t) => dom.scroll_into_view(t.node).await,
            None => dom.scroll_by(0.0, self.scroll_step).await,
        };
        if let Err(e) = result {
            debug!(error = %e, "scroll failed");
        }
        ActionOutcome::Succeeded
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::TypingConfig;
    use crate::dom::fake::{ClickEffect, FakeDom};
    use crate::timing::HumanTiming;

    pub(crate) fn executor() -> Executor {
        let config = EngineConfig::default();
        let timing = Arc::new(HumanTiming::seeded(&config.typing, 42));
        Executor::new(&config, timing).unwrap()
    }

    /// All delays zero, for tests that talk to real sockets.
    pub(crate) fn instant_executor() -> Executor {
        let mut config = EngineConfig::default();
        config.typing = TypingConfig {
            keystroke_ms: 0,
            thinking_chance: 0.0,
            pre_click_ms: 0,
            settle_ms: 0,
            mouse_step_ms: 0,
            ..Default::default()
        };
        config.engine.mouse_paths = false;
        let timing = Arc::new(HumanTiming::seeded(&config.typing, 42));
        Executor::new(&config, timing).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn type_replaces_value_and_fires_events() {
        let dom = FakeDom::new("about:blank");
        let input = dom.add(None, "input", &[("id", "title"), ("value", "old")]);
        let action = Action::new(ActionKind::Type, "fill title")
            .with_selector("#title")
            .with_value("Blue Jacket");

        let outcome = executor().execute(&dom, &action).await;
        assert_eq!(outcome, ActionOutcome::Succeeded);
        assert_eq!(dom.value(input).as_deref(), Some("Blue Jacket"));

        let kinds = dom.event_kinds(input);
        assert_eq!(kinds[0], "input", "clearing fires input first");
        assert_eq!(&kinds[1..4], ["keydown", "input", "keyup"]);
        assert_eq!(kinds.iter().filter(|k| **k == "keydown").count(), 11);
        assert_eq!(&kinds[kinds.len() - 2..], ["change", "blur"]);
    }

    #[tokio::test(start_paused = true)]
    async fn type_takes_human_time() {
        let dom = FakeDom::new("about:blank");
        dom.add(None, "textarea", &[("name", "d")]);
        let action = Action::new(ActionKind::Type, "describe")
            .with_selector("textarea[name=\"d\"]")
            .with_value("0123456789");

        let start = tokio::time::Instant::now();
        executor().execute(&dom, &action).await;
        let elapsed = start.elapsed();
        // 10 keystrokes at 90ms +-30%.
        assert!(elapsed >= Duration::from_millis(630), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn type_fails_on_missing_or_non_editable_targets() {
        let dom = FakeDom::new("about:blank");
        dom.add_text(None, "button", &[("id", "go")], "Go");
        let ex = executor();

        let missing = Action::new(ActionKind::Type, "x").with_selector("#nope").with_value("a");
        assert!(matches!(ex.execute(&dom, &missing).await, ActionOutcome::Failed(_)));

        let button = Action::new(ActionKind::Type, "x").with_selector("#go").with_value("a");
        assert!(matches!(ex.execute(&dom, &button).await, ActionOutcome::Failed(_)));

        let synthetic = Action::new(ActionKind::Type, "x").with_selector("input-0").with_value("a");
        assert!(matches!(ex.execute(&dom, &synthetic).await, ActionOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn click_dispatches_mouse_sequence_after_path() {
        let dom = FakeDom::new("about:blank");
        let button = dom.add_text(None, "button", &[("id", "save")], "Save");
        let action = Action::new(ActionKind::Click, "save").with_selector("#save");

        assert_eq!(executor().execute(&dom, &action).await, ActionOutcome::Succeeded);
        assert_eq!(dom.event_kinds(button), ["mouseover", "mousedown", "mouseup", "click"]);
        assert_eq!(dom.scrolled_into_view(), vec![button]);
        let moves = dom.mouse_moves();
        assert_eq!(moves.len(), TypingConfig::default().mouse_steps as usize);
        assert_eq!(moves.last(), Some(&(60.0, 12.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn click_falls_back_to_text() {
        let dom = FakeDom::new("about:blank");
        let next = dom.add_text(None, "button", &[], "Next step");
        let action = Action::new(ActionKind::Click, "continue")
            .with_selector("button-0")
            .with_value("next");

        assert_eq!(executor().execute(&dom, &action).await, ActionOutcome::Succeeded);
        assert_eq!(dom.event_kinds(next).last(), Some(&"click"));

        let nothing = Action::new(ActionKind::Click, "publish").with_value("Publish");
        assert!(matches!(executor().execute(&dom, &nothing).await, ActionOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn text_click_lands_on_nested_button() {
        let dom = FakeDom::new("about:blank");
        let steps = dom.add(None, "ul", &[("class", "wizard")]);
        let item = dom.add(Some(steps), "li", &[]);
        let label = dom.add(Some(item), "label", &[]);
        let next = dom.add_text(Some(label), "button", &[("type", "button")], "Next");
        let action = Action::new(ActionKind::Click, "next page").with_value("Next");

        assert_eq!(executor().execute(&dom, &action).await, ActionOutcome::Succeeded);
        assert_eq!(dom.event_kinds(next).last(), Some(&"click"));
        assert!(dom.events(label).is_empty());
        assert!(dom.events(item).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn native_select_sets_value() {
        let dom = FakeDom::new("about:blank");
        let sel = dom.add(None, "select", &[("name", "condition")]);
        dom.set_options(sel, &["New", "Like new", "Good"]);
        let action = Action::new(ActionKind::Select, "condition")
            .with_selector("select[name=\"condition\"]")
            .with_value("good");

        assert_eq!(executor().execute(&dom, &action).await, ActionOutcome::Succeeded);
        assert_eq!(dom.value(sel).as_deref(), Some("Good"));

        let bad = action.clone().with_value("Broken");
        assert!(matches!(executor().execute(&dom, &bad).await, ActionOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_dropdown_opens_then_picks() {
        let dom = FakeDom::new("about:blank");
        let combo = dom.add_text(None, "div", &[("role", "combobox"), ("id", "size")], "Choose size");
        let list = dom.add(None, "ul", &[("role", "listbox")]);
        let small = dom.add_text(Some(list), "li", &[("role", "option")], "Small");
        let medium = dom.add_text(Some(list), "li", &[("role", "option")], "Medium");
        dom.hide(list);
        dom.on_click(combo, ClickEffect::Show(list));
        dom.on_click(medium, ClickEffect::SetText(combo, "Medium".into()));

        let action = Action::new(ActionKind::Select, "size")
            .with_selector("#size")
            .with_value("Medium");
        assert_eq!(executor().execute(&dom, &action).await, ActionOutcome::Succeeded);
        assert_eq!(dom.event_kinds(combo).last(), Some(&"click"));
        assert_eq!(dom.event_kinds(medium).last(), Some(&"click"));
        assert!(dom.events(small).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_always_succeeds() {
        let dom = FakeDom::new("about:blank");
        let ex = executor();
        let plain = Action::new(ActionKind::Scroll, "look further down");
        assert_eq!(ex.execute(&dom, &plain).await, ActionOutcome::Succeeded);
        assert_eq!(dom.scroll_offset(), (0.0, 500.0));

        let missing = plain.clone().with_selector("#footer");
        assert_eq!(ex.execute(&dom, &missing).await, ActionOutcome::Succeeded);
        assert_eq!(dom.scroll_offset(), (0.0, 1000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_and_settle_durations() {
        let dom = FakeDom::new("about:blank");
        let ex = executor();

        let start = tokio::time::Instant::now();
        ex.execute(&dom, &Action::new(ActionKind::Wait, "pause").with_wait(250)).await;
        assert_eq!(start.elapsed(), Duration::from_millis(250));

        let start = tokio::time::Instant::now();
        ex.execute(&dom, &Action::new(ActionKind::Wait, "pause")).await;
        assert_eq!(start.elapsed(), Duration::from_millis(1000));

        let start = tokio::time::Instant::now();
        let scroll = Action::new(ActionKind::Scroll, "down").with_wait(400);
        ex.execute(&dom, &scroll).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn terminal_actions_touch_nothing() {
        let dom = FakeDom::new("about:blank");
        let ex = executor();
        assert_eq!(
            ex.execute(&dom, &Action::new(ActionKind::Done, "published")).await,
            ActionOutcome::Done
        );
        assert_eq!(
            ex.execute(&dom, &Action::new(ActionKind::Error, "login wall")).await,
            ActionOutcome::Error("login wall".into())
        );
        assert!(dom.mouse_moves().is_empty());
    }
}
