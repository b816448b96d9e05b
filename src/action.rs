//! Planner wire model and batch validation.
//!
//! The planner is trusted for nothing: [`parse_plan`] turns whatever body
//! came back into at most [`MAX_BATCH`] well-formed actions, or a single
//! `error` action when nothing usable is left.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Actions executed per planning round.
pub const MAX_BATCH: usize = 5;

/// Longest `waitMs` honoured, in milliseconds.
pub const MAX_WAIT_MS: u64 = 30_000;

/// Description attached to the synthetic error for an unusable response.
pub const MALFORMED_PLAN: &str = "planner returned an unusable response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Type,
    Click,
    Select,
    Upload,
    Scroll,
    Wait,
    Done,
    Error,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Type => "type",
            ActionKind::Click => "click",
            ActionKind::Select => "select",
            ActionKind::Upload => "upload",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
            ActionKind::Done => "done",
            ActionKind::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "type" => ActionKind::Type,
            "click" => ActionKind::Click,
            "select" => ActionKind::Select,
            "upload" => ActionKind::Upload,
            "scroll" => ActionKind::Scroll,
            "wait" => ActionKind::Wait,
            "done" => ActionKind::Done,
            "error" => ActionKind::Error,
            _ => return None,
        })
    }

    /// Whether this kind ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionKind::Done | ActionKind::Error)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instruction from the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "action")]
    pub kind: ActionKind,

    /// CSS selector of the target element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Text to type, option to pick, label to click, or image URLs to upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Human-readable intent.
    pub description: String,

    /// Settle time after the action, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

impl Action {
    pub fn new(kind: ActionKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            selector: None,
            value: None,
            description: description.into(),
            wait_ms: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_wait(mut self, ms: u64) -> Self {
        self.wait_ms = Some(ms);
        self
    }

    /// The synthetic error action used for unusable planner responses.
    pub fn malformed() -> Self {
        Self::new(ActionKind::Error, MALFORMED_PLAN)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref s) = self.selector {
            write!(f, " {}", s)?;
        }
        write!(f, ": {}", self.description)
    }
}

/// An executed action and whether it worked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub action: Action,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the planner needs to know about the job besides the page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub marketplace: String,
    pub current_step: String,
    pub history: Vec<HistoryEntry>,
}

impl TaskState {
    pub fn new(marketplace: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            marketplace: marketplace.into(),
            current_step: step.into(),
            history: Vec::new(),
        }
    }

    /// The most recent `limit` history entries, oldest first.
    pub fn recent_history(&self, limit: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }
}

/// Validate a raw planner body into an executable batch.
///
/// Accepts a JSON array or a single object. Entries with a missing or
/// unknown `action` are dropped; scalar values are coerced to text;
/// missing descriptions are synthesized; `waitMs` is clamped. The result is
/// never empty and never longer than [`MAX_BATCH`].
pub fn parse_plan(body: &str) -> Vec<Action> {
    let parsed: Value = match serde_json::from_str(body.trim()) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "planner response is not JSON");
            return vec![Action::malformed()];
        }
    };
    let entries = match parsed {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => {
            warn!(kind = json_kind(&other), "planner response is not an action list");
            return vec![Action::malformed()];
        }
    };

    let mut batch: Vec<Action> = entries.iter().filter_map(repair).collect();
    if batch.is_empty() {
        warn!(entries = entries.len(), "planner response held no valid action");
        return vec![Action::malformed()];
    }
    if batch.len() > MAX_BATCH {
        debug!(dropped = batch.len() - MAX_BATCH, "truncating action batch");
        batch.truncate(MAX_BATCH);
    }
    batch
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn text_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) if !items.is_empty() => Some(Value::Array(items.clone()).to_string()),
        _ => None,
    }
}

fn wait_field(obj: &serde_json::Map<String, Value>) -> Option<u64> {
    let raw = obj.get("waitMs").or_else(|| obj.get("wait_ms"))?;
    let ms = match raw {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    Some(ms.min(MAX_WAIT_MS))
}

fn default_description(kind: ActionKind, selector: Option<&str>, value: Option<&str>) -> String {
    match (selector, value) {
        (Some(s), _) => format!("{} {}", kind, s),
        (None, Some(v)) => format!("{} \"{}\"", kind, v.chars().take(40).collect::<String>()),
        (None, None) => kind.to_string(),
    }
}

fn repair(entry: &Value) -> Option<Action> {
    let obj = entry.as_object()?;
    let Some(kind) = obj
        .get("action")
        .and_then(Value::as_str)
        .and_then(ActionKind::parse)
    else {
        debug!(entry = %entry, "dropping action with unknown kind");
        return None;
    };
    let selector = text_field(obj, "selector");
    let value = text_field(obj, "value");
    let description = text_field(obj, "description").unwrap_or_else(|| {
        default_description(kind, selector.as_deref(), value.as_deref())
    });
    Some(Action {
        kind,
        selector,
        value,
        description,
        wait_ms: wait_field(obj),
    })
}

/// JSON schema of one wire action.
pub fn action_schema() -> schemars::Schema {
    schemars::schema_for!(Action)
}

        assert_eq!(batch[2].wait_ms, Some(250));
        assert_eq!(batch[3].wait_ms, Some(MAX_WAIT_MS));
    }

    #[test]
    fn wire_shape() {
        let action = Action::new(ActionKind::Wait, "let the page settle").with_wait(500);
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "wait");
        assert_eq!(json["waitMs"], 500);
        assert!(json.get("selector").is_none());

        let entry = HistoryEntry {
            action,
            success: true,
            error: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action"], "wait");
        assert_eq!(json["success"], true);
    }

    #[test]
    fn recent_history_keeps_the_tail() {
        let mut state = TaskState::new("mercari", "create_listing");
        for i in 0..15 {
            state.history.push(HistoryEntry {
                action: Action::new(ActionKind::Wait, format!("wait {i}")),
                success: true,
                error: None,
            });
        }
        let recent = state.recent_history(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].action.description, "wait 5");
    }

    #[test]
    fn schema_names_the_action_field() {
        let schema = serde_json::to_value(action_schema()).unwrap();
        assert!(schema["properties"]["action"].is_object(), "{schema}");
        assert!(schema["properties"]["waitMs"].is_object(), "{schema}");
    }
}
