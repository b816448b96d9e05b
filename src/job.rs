//! Job intake: what to fill in, where, and with which session.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{http_url, Error, Result};

/// One automation job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Marketplace identifier passed through to the planner.
    pub marketplace: String,

    /// Step label, e.g. `create_listing`.
    #[serde(default = "default_step")]
    pub step: String,

    /// Page the run starts on.
    pub start_url: String,

    /// Structured record the planner fills the form from.
    #[serde(default)]
    pub target: Value,

    /// Previously captured session cookies.
    #[serde(default)]
    pub cookies: Vec<SessionCookie>,
}

fn default_step() -> String {
    "create_listing".into()
}

impl Job {
    /// Load a job file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let job: Job = serde_json::from_str(content)?;
        job.validate()?;
        Ok(job)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let job: Job = serde_yaml::from_str(content)?;
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<()> {
        if self.marketplace.trim().is_empty() {
            return Err(Error::Config("job.marketplace is required".into()));
        }
        if http_url(&self.start_url).is_none() {
            return Err(Error::Config(format!(
                "job.startUrl must be an http(s) URL, got {:?}",
                self.start_url
            )));
        }
        if let Some(c) = self.cookies.iter().find(|c| c.name.is_empty()) {
            return Err(Error::Config(format!(
                "job cookie for domain {:?} has no name",
                c.domain
            )));
        }
        Ok(())
    }

    /// Cookies still valid at `now`.
    pub fn live_cookies(&self, now: DateTime<Utc>) -> impl Iterator<Item = &SessionCookie> {
        self.cookies.iter().filter(move |c| !c.is_expired(now))
    }
}

/// A captured session cookie.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Expiry as Unix seconds; absent or non-positive means a session cookie.
    #[serde(default)]
    pub expires: Option<f64>,
}

impl SessionCookie {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(secs) if secs > 0.0 => (secs as i64) <= now.timestamp(),
            _ => false,
        }
    }
}
