use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::PlannerConfig;

/// Picks the planner base URL once per client.
///
/// Candidates are probed in order with `GET {candidate}{health_path}`; the
/// first 2xx wins and is cached for the client's lifetime. When every probe
/// fails the default endpoint is used (and cached) without probing.
pub struct EndpointSelector {
    candidates: Vec<String>,
    default: String,
    health_path: String,
    probe_timeout: Duration,
    chosen: OnceCell<String>,
}

impl EndpointSelector {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            candidates: config
                .endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            default: config.default_endpoint.trim_end_matches('/').to_string(),
            health_path: config.health_path.clone(),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            chosen: OnceCell::new(),
        }
    }

    /// The selected endpoint, probing on first use.
    pub async fn resolve(&self, client: &reqwest::Client) -> &str {
        self.chosen.get_or_init(|| self.probe(client)).await
    }

    /// The cached endpoint, if selection already ran.
    pub fn chosen(&self) -> Option<&str> {
        self.chosen.get().map(String::as_str)
    }

    async fn probe(&self, client: &reqwest::Client) -> String {
        for candidate in &self.candidates {
            let url = format!("{}{}", candidate, self.health_path);
            match client.get(&url).timeout(self.probe_timeout).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(endpoint = %candidate, "planner endpoint selected");
                    return candidate.clone();
                }
                Ok(resp) => debug!(endpoint = %candidate, status = %resp.status(), "health probe rejected"),
                Err(e) => debug!(endpoint = %candidate, error = %e, "health probe failed"),
            }
        }
        if !self.candidates.is_empty() {
            warn!(default = %self.default, "no planner endpoint passed its health probe");
        }
        self.default.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn health(status: u16, calls: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(status))
            .expect(calls)
            .mount(&server)
            .await;
        server
    }

    fn config(endpoints: Vec<String>) -> PlannerConfig {
        PlannerConfig {
            endpoints,
            default_endpoint: "http://fallback.invalid/".into(),
            probe_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_healthy_candidate_wins_and_is_cached() {
        let sick = health(503, 1).await;
        let healthy = health(200, 1).await;
        let never = health(200, 0).await;
        let selector = EndpointSelector::new(&config(vec![
            "http://127.0.0.1:1".into(),
            sick.uri(),
            format!("{}/", healthy.uri()),
            never.uri(),
        ]));
        let client = reqwest::Client::new();

        assert_eq!(selector.chosen(), None);
        assert_eq!(selector.resolve(&client).await, healthy.uri());
        assert_eq!(selector.resolve(&client).await, healthy.uri());
        assert_eq!(selector.chosen(), Some(healthy.uri().as_str()));
    }

    #[tokio::test]
    async fn falls_back_to_default() {
        let sick = health(500, 1).await;
        let selector = EndpointSelector::new(&config(vec![sick.uri()]));
        let client = reqwest::Client::new();
        assert_eq!(selector.resolve(&client).await, "http://fallback.invalid");
        assert_eq!(selector.resolve(&client).await, "http://fallback.invalid");
    }

    #[tokio::test]
    async fn no_candidates_means_default_without_probing() {
        let selector = EndpointSelector::new(&config(Vec::new()));
        let client = reqwest::Client::new();
        assert_eq!(selector.resolve(&client).await, "http://fallback.invalid");
    }
}
