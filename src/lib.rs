//! # formpilot
//!
//! Agentic form automation. Each iteration snapshots the live page, asks a
//! remote planner what to do next, and executes a small batch of actions with
//! human-plausible timing, until the planner says it is done, reports an
//! error, or the iteration/time budget runs out.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use formpilot::{EngineConfig, Job, Runner};
//!
//! # #[tokio::main]
//! # async fn main() -> formpilot::Result<()> {
//! let config = EngineConfig::load("formpilot.yaml")?;
//! let job = Job::load("job.json")?;
//! let runner = Runner::new(&config.browser).await?;
//! let report = runner.run_job(&config, &job).await?;
//! println!("{}: {}", report.outcome, report.reason);
//! runner.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod config;
pub mod dom;
pub mod executor;
pub mod inspect;
pub mod job;
pub mod observe;
pub mod obstruction;
pub mod planner;
pub mod runner;
pub mod timing;

pub use action::{parse_plan, Action, ActionKind, HistoryEntry, TaskState};
pub use config::{BrowserConfig, EngineConfig};
pub use dom::{Dom, PageDom};
pub use executor::{ActionOutcome, Executor};
pub use job::{Job, SessionCookie};
pub use observe::{ElementDescriptor, ModalDescriptor, PageSnapshot};
pub use planner::{Planner, PlanningClient};
pub use runner::{Orchestrator, RunReport, Runner, Terminal};
pub use timing::{DelayPolicy, HumanTiming};

/// Result type for formpilot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or driving a run.
///
/// Only setup failures (config, browser launch, navigation) escape a run;
/// everything that happens inside the orchestration loop is absorbed into
/// history or a terminal state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("dom error: {0}")]
    Dom(String),

    #[error("planner error: {0}")]
    Planner(String),

    #[error("circuit open, retry in {remaining_ms}ms")]
    CircuitOpen { remaining_ms: u64 },

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        source: Box<Error>,
    },
}

impl Error {
    /// Whether another attempt at the same remote call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Planner(_) | Error::Io(_))
    }
}

/// `raw` parsed as an absolute URL with an `http` or `https` scheme.
pub fn http_url(raw: &str) -> Option<reqwest::Url> {
    let url = reqwest::Url::parse(raw.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}
