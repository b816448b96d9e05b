//! The observe → plan → act state machine.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::{parse_plan, Action, ActionKind, HistoryEntry, TaskState, MAX_BATCH};
use crate::config::LoopConfig;
use crate::dom::Dom;
use crate::executor::{ActionOutcome, Executor};
use crate::observe::{build_snapshot, PageSnapshot};
use crate::obstruction::{detect_challenge, dismiss_modals, wait_for_challenge};
use crate::planner::Planner;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// The planner declared the task complete.
    Done,
    /// The planner gave up, or its response was unusable.
    Error(String),
    MaxIterations,
    Timeout,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::Done => "done",
            Terminal::Error(_) => "error",
            Terminal::MaxIterations => "max_iterations",
            Terminal::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Terminal {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Where the loop is.
#[derive(Debug)]
pub enum Phase {
    Observing,
    Planning(Box<PageSnapshot>),
    Acting(Vec<Action>),
    Terminated(Terminal),
}

/// Outcome of one run, with everything that was executed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub outcome: Terminal,
    pub reason: String,
    pub iterations: u32,
    pub history: Vec<HistoryEntry>,
    pub modals_dismissed: u32,
    pub challenges_seen: u32,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_done(&self) -> bool {
        self.outcome == Terminal::Done
    }
}

/// Drives one run against one page.
///
/// Owns the task history so nothing executed is lost when the wall-clock
/// budget cuts a run short.
pub struct Orchestrator<'a, D: Dom + ?Sized, P: Planner + ?Sized> {
    dom: &'a D,
    planner: &'a P,
    executor: &'a Executor,
    config: &'a LoopConfig,
    target: &'a Value,
    task: TaskState,
    phase: Phase,
    iterations: u32,
    modals_dismissed: u32,
    challenges_seen: u32,
    started: Instant,
    deadline: Instant,
}

impl<'a, D: Dom + ?Sized, P: Planner + ?Sized> Orchestrator<'a, D, P> {
    pub fn new(
        dom: &'a D,
        planner: &'a P,
        executor: &'a Executor,
        config: &'a LoopConfig,
        task: TaskState,
        target: &'a Value,
    ) -> Self {
        let started = Instant::now();
        Self {
            dom,
            planner,
            executor,
            config,
            target,
            task,
            phase: Phase::Observing,
            iterations: 0,
            modals_dismissed: 0,
            challenges_seen: 0,
            started,
            deadline: started + Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn task(&self) -> &TaskState {
        &self.task
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Run one transition. Does nothing once terminated.
    pub async fn advance(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Observing);
        self.phase = match phase {
            Phase::Observing => self.observe().await,
            Phase::Planning(snapshot) => self.plan(&snapshot).await,
            Phase::Acting(batch) => self.act(batch).await,
            done @ Phase::Terminated(_) => done,
        };
    }

    /// Drive the loop to a terminal state within the wall-clock budget.
    pub async fn run(mut self) -> RunReport {
        self.started = Instant::now();
        self.deadline = self.started + Duration::from_secs(self.config.timeout_secs);
        info!(
            marketplace = %self.task.marketplace,
            step = %self.task.current_step,
            max_iterations = self.config.max_iterations,
            "run started"
        );
        let budget = Duration::from_secs(self.config.timeout_secs);
        let outcome = match tokio::time::timeout(budget, self.drive()).await {
            Ok(terminal) => terminal,
            Err(_) => {
                warn!(iteration = self.iterations, "wall-clock budget exhausted mid-iteration");
                Terminal::Timeout
            }
        };
        self.report(outcome)
    }

    async fn drive(&mut self) -> Terminal {
        loop {
            self.advance().await;
            if let Phase::Terminated(ref terminal) = self.phase {
                return terminal.clone();
            }
        }
    }

    async fn observe(&mut self) -> Phase {
        if Instant::now() >= self.deadline {
            return Phase::Terminated(Terminal::Timeout);
        }
        if self.iterations >= self.config.max_iterations {
            return Phase::Terminated(Terminal::MaxIterations);
        }
        self.iterations += 1;
        debug!(iteration = self.iterations, marketplace = %self.task.marketplace, "observing");

        self.modals_dismissed += dismiss_modals(
            self.dom,
            self.executor,
            self.config.modal_attempts,
            Duration::from_millis(self.config.modal_interval_ms),
        )
        .await;

        let mut challenge = detect_challenge(self.dom).await;
        if let Some(ref found) = challenge {
            self.challenges_seen += 1;
            warn!(provider = %found.provider, "verification challenge on page, waiting");
            let timeout = Duration::from_secs(self.config.challenge_timeout_secs);
            if wait_for_challenge(self.dom, timeout).await {
                info!("challenge cleared");
                challenge = None;
            } else {
                challenge = detect_challenge(self.dom).await;
            }
        }

        match build_snapshot(self.dom).await {
            Ok(mut snapshot) => {
                snapshot.challenge = challenge;
                Phase::Planning(Box::new(snapshot))
            }
            Err(e) => {
                warn!(iteration = self.iterations, error = %e, "snapshot failed");
                self.pause_after_failure().await;
                Phase::Observing
            }
        }
    }

    async fn plan(&mut self, snapshot: &PageSnapshot) -> Phase {
        match self.planner.plan(snapshot, &self.task, self.target).await {
            Ok(body) => {
                let batch = parse_plan(&body);
                debug!(iteration = self.iterations, actions = batch.len(), "plan validated");
                Phase::Acting(batch)
            }
            Err(e) => {
                warn!(iteration = self.iterations, error = %e, "planning failed");
                self.pause_after_failure().await;
                Phase::Observing
            }
        }
    }

    async fn act(&mut self, batch: Vec<Action>) -> Phase {
        for action in batch.into_iter().take(MAX_BATCH) {
            let outcome = self.executor.execute(self.dom, &action).await;
            info!(
                iteration = self.iterations,
                action = %action.kind,
                outcome = %outcome,
                "{}",
                action.description
            );
            self.task.history.push(HistoryEntry {
                success: outcome.is_success(),
                error: outcome.reason().map(str::to_string),
                action,
            });
            match outcome {
                ActionOutcome::Done => return Phase::Terminated(Terminal::Done),
                ActionOutcome::Error(reason) => return Phase::Terminated(Terminal::Error(reason)),
                ActionOutcome::Succeeded | ActionOutcome::Failed(_) => {}
            }
        }
        Phase::Observing
    }

    async fn pause_after_failure(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.failure_pause_ms)).await;
    }

    fn report(self, outcome: Terminal) -> RunReport {
        let reason = match outcome {
            Terminal::Done => self
                .task
                .history
                .last()
                .filter(|h| h.action.kind == ActionKind::Done)
                .map(|h| h.action.description.clone())
                .unwrap_or_else(|| "task complete".to_string()),
            Terminal::Error(ref reason) => reason.clone(),
            Terminal::MaxIterations => format!(
                "no terminal action after {} iterations",
                self.config.max_iterations
            ),
            Terminal::Timeout => format!(
                "wall-clock budget of {}s exhausted",
                self.config.timeout_secs
            ),
        };
        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            outcome = %outcome,
            iterations = self.iterations,
            actions = self.task.history.len(),
            duration_ms,
            "run finished"
        );
        RunReport {
            outcome,
            reason,
            iterations: self.iterations,
            history: self.task.history,
            modals_dismissed: self.modals_dismissed,
            challenges_seen: self.challenges_seen,
            duration_ms,
        }
    }
}
