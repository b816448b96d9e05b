mod orchestrator;

pub use orchestrator::{Orchestrator, Phase, RunReport, Terminal};

use std::sync::Arc;

use chrono::Utc;
use eoka::{Browser, Page};
use tracing::{debug, info};

use crate::action::TaskState;
use crate::config::{BrowserConfig, EngineConfig};
use crate::dom::PageDom;
use crate::executor::Executor;
use crate::job::Job;
use crate::planner::PlanningClient;
use crate::timing::{DelayPolicy, HumanTiming};
use crate::Result;

/// A stealth browser with one blank tab, reused for a job run.
pub struct Runner {
    browser: Browser,
    page: Page,
}

impl Runner {
    /// Launch Chrome with the stealth settings from `config`.
    pub async fn new(config: &BrowserConfig) -> Result<Self> {
        debug!(
            headless = config.headless,
            proxied = config.proxy.is_some(),
            width = config.viewport.width,
            height = config.viewport.height,
            "starting stealth browser"
        );
        let browser = Browser::launch_with_config(config.stealth()).await?;
        let page = browser.new_page("about:blank").await?;
        Ok(Self { browser, page })
    }

    /// Restore the job's session, open its start page and run the loop.
    ///
    /// Only setup failures are returned as errors; how the run itself ended
    /// is in the report.
    pub async fn run_job(&self, config: &EngineConfig, job: &Job) -> Result<RunReport> {
        info!(marketplace = %job.marketplace, url = %job.start_url, "opening start page");
        self.page.goto(&job.start_url).await?;
        if self.restore_session(job).await? > 0 {
            self.page.goto(&job.start_url).await?;
        }

        let dom = PageDom::new(&self.page);
        let timing: Arc<dyn DelayPolicy> = Arc::new(HumanTiming::new(&config.typing));
        let executor = Executor::new(config, timing)?;
        let planner = PlanningClient::new(&config.planner)?;
        let task = TaskState::new(&job.marketplace, &job.step);

        let report = Orchestrator::new(&dom, &planner, &executor, &config.engine, task, &job.target)
            .run()
            .await;
        Ok(report)
    }

    /// Set the job's unexpired cookies on the page. Returns how many were set.
    async fn restore_session(&self, job: &Job) -> Result<usize> {
        let mut applied = 0;
        for cookie in job.live_cookies(Utc::now()) {
            self.page
                .set_cookie(
                    &cookie.name,
                    &cookie.value,
                    cookie.domain.as_deref(),
                    cookie.path.as_deref(),
                )
                .await?;
            applied += 1;
        }
        if !job.cookies.is_empty() {
            let skipped = job.cookies.len() - applied;
            info!(applied, skipped, "session cookies restored");
        }
        Ok(applied)
    }

    /// Close the browser.
    pub async fn close(self) -> Result<()> {
        self.browser.close().await?;
        Ok(())
    }
}
