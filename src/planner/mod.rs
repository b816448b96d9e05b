//! Planning client: asks the remote planner what to do next.
//!
//! All state a run accumulates against the service (chosen endpoint,
//! circuit breaker) lives on one [`PlanningClient`] instance.

pub mod endpoint;
pub mod resilience;

pub use endpoint::EndpointSelector;
pub use resilience::{call_with_retry, CircuitBreaker, CircuitState, RetryPolicy};

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::action::{HistoryEntry, TaskState};
use crate::config::PlannerConfig;
use crate::observe::PageSnapshot;
use crate::{Error, Result};

/// Header carrying the per-request correlation id.
pub const CORRELATION_HEADER: &str = "X-Correlation-ID";

/// Body of a planning request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest<'a> {
    pub page_snapshot: &'a PageSnapshot,
    pub target_data: &'a Value,
    pub current_step: &'a str,
    pub previous_actions: &'a [HistoryEntry],
    pub marketplace: &'a str,
    pub correlation_id: String,
}

/// Source of action batches.
///
/// Returns the raw response body; the loop validates it with
/// [`crate::parse_plan`] so every planner gets the same repair rules.
#[async_trait(?Send)]
pub trait Planner {
    async fn plan(&self, snapshot: &PageSnapshot, task: &TaskState, target: &Value) -> Result<String>;
}

/// HTTP client for the planning service, with endpoint failover, retries
/// and a circuit breaker.
pub struct PlanningClient {
    http: reqwest::Client,
    endpoints: EndpointSelector,
    plan_path: String,
    api_key: Option<String>,
    timeout: Duration,
    history_limit: usize,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl PlanningClient {
    pub fn new(config: &PlannerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("formpilot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            endpoints: EndpointSelector::new(config),
            plan_path: config.plan_path.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            timeout: Duration::from_millis(config.request_timeout_ms),
            history_limit: config.history_limit,
            retry: RetryPolicy::new(&config.retry),
            breaker: CircuitBreaker::new(&config.circuit),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Endpoint chosen by the health probes, once a request has been made.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoints.chosen()
    }

    async fn send_once(&self, url: &str, request: &PlanRequest<'_>) -> Result<String> {
        let mut builder = self
            .http
            .post(url)
            .timeout(self.timeout)
            .header(CORRELATION_HEADER, &request.correlation_id)
            .json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Err(Error::Planner(format!("status {}: {}", status, snippet)));
        }
        Ok(body)
    }
}

#[async_trait(?Send)]
impl Planner for PlanningClient {
    async fn plan(&self, snapshot: &PageSnapshot, task: &TaskState, target: &Value) -> Result<String> {
        let request = PlanRequest {
            page_snapshot: snapshot,
            target_data: target,
            current_step: &task.current_step,
            previous_actions: task.recent_history(self.history_limit),
            marketplace: &task.marketplace,
            correlation_id: Uuid::new_v4().to_string(),
        };
        let endpoint = self.endpoints.resolve(&self.http).await;
        let url = format!("{}{}", endpoint, self.plan_path);
        info!(
            correlation_id = %request.correlation_id,
            marketplace = %task.marketplace,
            history = request.previous_actions.len(),
            "requesting plan"
        );
        let body = call_with_retry("plan", &self.retry, &self.breaker, |_| {
            self.send_once(&url, &request)
        })
        .await?;
        debug!(correlation_id = %request.correlation_id, bytes = body.len(), "plan received");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind};
    use crate::config::{CircuitConfig, RetryConfig};
    use chrono::Utc;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot() -> PageSnapshot {
        PageSnapshot {
            url: "https://shop.test/sell".into(),
            title: "Sell".into(),
            timestamp: Utc::now(),
            inputs: Vec::new(),
            textareas: Vec::new(),
            buttons: Vec::new(),
            selects: Vec::new(),
            labels: Vec::new(),
            modals: Vec::new(),
            errors: Vec::new(),
            challenge: None,
        }
    }

    fn task(history: usize) -> TaskState {
        let mut task = TaskState::new("mercari", "create_listing");
        for i in 0..history {
            task.history.push(HistoryEntry {
                action: Action::new(ActionKind::Wait, format!("step {i}")),
                success: i % 2 == 0,
                error: None,
            });
        }
        task
    }

    fn client_for(server: &MockServer) -> PlanningClient {
        PlanningClient::new(&PlannerConfig {
            endpoints: vec![server.uri()],
            default_endpoint: server.uri(),
            api_key: Some("secret".into()),
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter: 0.2,
            },
            ..Default::default()
        })
        .unwrap()
    }

    async fn mount_health(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn request_carries_snapshot_task_and_correlation_id() {
        let server = MockServer::start().await;
        mount_health(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/plan"))
            .and(header_exists(CORRELATION_HEADER))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"action":"done"}]"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let target = serde_json::json!({"title": "Blue Jacket", "price": 40});
        let body = client.plan(&snapshot(), &task(15), &target).await.unwrap();
        assert_eq!(body, r#"[{"action":"done"}]"#);
        assert_eq!(client.endpoint(), Some(server.uri().as_str()));

        let requests = server.received_requests().await.unwrap();
        let plan = requests
            .iter()
            .find(|r| r.url.path() == "/api/plan")
            .unwrap();
        let json: Value = serde_json::from_slice(&plan.body).unwrap();
        assert_eq!(json["marketplace"], "mercari");
        assert_eq!(json["currentStep"], "create_listing");
        assert_eq!(json["targetData"]["title"], "Blue Jacket");
        assert_eq!(json["pageSnapshot"]["url"], "https://shop.test/sell");
        let previous = json["previousActions"].as_array().unwrap();
        assert_eq!(previous.len(), 10);
        assert_eq!(previous[0]["description"], "step 5");
        let header_id = plan.headers.get(CORRELATION_HEADER).unwrap().to_str().unwrap();
        assert_eq!(json["correlationId"], header_id);
    }

    #[tokio::test]
    async fn correlation_id_is_fresh_per_request() {
        let server = MockServer::start().await;
        mount_health(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/plan"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let target = Value::Null;
        client.plan(&snapshot(), &task(0), &target).await.unwrap();
        client.plan(&snapshot(), &task(0), &target).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let ids: Vec<String> = requests
            .iter()
            .filter(|r| r.url.path() == "/api/plan")
            .map(|r| r.headers.get(CORRELATION_HEADER).unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let server = MockServer::start().await;
        mount_health(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/plan"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/plan"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"action":"done"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let body = client.plan(&snapshot(), &task(0), &Value::Null).await.unwrap();
        assert_eq!(body, r#"{"action":"done"}"#);
        assert_eq!(client.breaker().state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_retries() {
        let server = MockServer::start().await;
        mount_health(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/plan"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.plan(&snapshot(), &task(0), &Value::Null).await.unwrap_err();
        match err {
            Error::RetriesExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("500"), "{source}");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn open_circuit_skips_the_network() {
        let server = MockServer::start().await;
        mount_health(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/plan"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let client = PlanningClient::new(&PlannerConfig {
            endpoints: vec![server.uri()],
            retry: RetryConfig {
                max_attempts: 1,
                ..Default::default()
            },
            circuit: CircuitConfig {
                failure_threshold: 2,
                cooldown_ms: 60_000,
            },
            ..Default::default()
        })
        .unwrap();

        for _ in 0..2 {
            assert!(client.plan(&snapshot(), &task(0), &Value::Null).await.is_err());
        }
        let err = client.plan(&snapshot(), &task(0), &Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }), "{err}");
    }
}
