use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::scheduler::task::JsonObject;

/// Boundary to the external code-agent service.
///
/// Abstracted behind a trait so executors can be driven against a test
/// double. Real implementation: [`AgentClient`].
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn analyze(&self, code: &str, language: &str) -> Result<JsonObject, AgentError>;

    /// Python-2 specific analysis endpoint.
    async fn analyze_python2(&self, code: &str) -> Result<JsonObject, AgentError>;

    async fn convert(
        &self,
        code: &str,
        from_version: &str,
        to_version: &str,
        options: Option<JsonObject>,
    ) -> Result<JsonObject, AgentError>;

    async fn generate_tests(
        &self,
        code: &str,
        test_type: &str,
        framework: &str,
    ) -> Result<JsonObject, AgentError>;
}

/// HTTP client for the code-agent service.
///
/// Each call carries its own request deadline; timeouts, 429 and 5xx
/// responses are retried with bounded exponential backoff, 4xx responses
/// are definitive and surfaced with the body preserved verbatim.
pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
    cfg: AgentConfig,
}

impl AgentClient {
    pub fn new(cfg: AgentConfig) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            cfg,
        }
    }

    async fn call(
        &self,
        endpoint: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<JsonObject, AgentError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut last_err: Option<AgentError> = None;

        for attempt in 0..=self.cfg.retry_count {
            if attempt > 0 {
                let backoff = self.cfg.backoff_base() * 2u32.saturating_pow(attempt - 1);
                warn!(
                    endpoint,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying agent call"
                );
                tokio::time::sleep(backoff).await;
            }

            debug!(endpoint, attempt, "calling code agent");
            match self.attempt(&url, &payload, timeout).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    warn!(endpoint, attempt, error = %err, "agent call failed");
                    let retryable = is_retryable(&err);
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let last = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        Err(AgentError::RetriesExhausted {
            attempts: self.cfg.retry_count + 1,
            last,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<JsonObject, AgentError> {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.as_u16() >= 400 {
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(AgentError::MalformedResponse),
        }
    }
}

/// Transport timeouts/connection failures, 429 and 5xx are worth retrying;
/// everything else is definitive.
fn is_retryable(err: &AgentError) -> bool {
    match err {
        AgentError::Transport(e) => e.is_timeout() || e.is_connect(),
        AgentError::Status { status, .. } => *status == 429 || (500..600).contains(status),
        AgentError::MalformedResponse | AgentError::RetriesExhausted { .. } => false,
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn analyze(&self, code: &str, language: &str) -> Result<JsonObject, AgentError> {
        self.call(
            "/api/v1/analyze",
            json!({ "code": code, "language": language }),
            self.cfg.analyze_timeout(),
        )
        .await
    }

    async fn analyze_python2(&self, code: &str) -> Result<JsonObject, AgentError> {
        self.call(
            "/api/v1/analyze/python2",
            json!({ "code": code, "language": "python" }),
            self.cfg.analyze_timeout(),
        )
        .await
    }

    async fn convert(
        &self,
        code: &str,
        from_version: &str,
        to_version: &str,
        options: Option<JsonObject>,
    ) -> Result<JsonObject, AgentError> {
        self.call(
            "/api/v1/convert",
            json!({
                "code": code,
                "language": "python",
                "conversion_type": "python_2_to_3",
                "from_version": from_version,
                "to_version": to_version,
                "options": options.unwrap_or_default(),
            }),
            self.cfg.convert_timeout(),
        )
        .await
    }

    async fn generate_tests(
        &self,
        code: &str,
        test_type: &str,
        framework: &str,
    ) -> Result<JsonObject, AgentError> {
        self.call(
            "/api/v1/generate-tests",
            json!({
                "code": code,
                "language": "python",
                "test_type": test_type,
                "framework": framework,
            }),
            self.cfg.test_timeout(),
        )
        .await
    }
}
