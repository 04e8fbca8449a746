//! Egress client traits for the collections orchestrator's dependencies,
//! each backed by a `reqwest` implementation and wrapped so that every
//! call first consults its circuit breaker, then retries transient
//! failures with full-jitter backoff.

use crate::circuit_breaker::{CircuitBreaker, CircuitOpenError};
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::EscalationEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("circuit open: {0}")]
    CircuitOpen(#[from] CircuitOpenError),
    #[error("request error: {0}")]
    Request(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// Retryable per the same rule the original service applied to its
    /// HTTP clients: connection/timeout failures retry, 4xx application
    /// errors don't.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Request(_) | ClientError::Timeout(_))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub display_name: String,
    pub collections_policy: String,
}

#[async_trait]
pub trait TenantDataClient: Send + Sync {
    async fn get_tenant_profile(&self, tenant_id: &str) -> Result<TenantProfile, ClientError>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmCompletionRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmCompletionResponse {
    pub content: String,
    pub model: String,
    pub latency_ms: u64,
    /// The model's own confidence in `content`, in `[0, 1]`. Drives the
    /// auto-send / queue-for-approval / escalate routing decision.
    pub confidence: f64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmCompletionRequest) -> Result<LlmCompletionResponse, ClientError>;
}

#[async_trait]
pub trait SmsGatewayClient: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), ClientError>;

    /// Pauses automated messaging to this number, used when an escalation
    /// hands the conversation to a human agent.
    async fn pause_messaging(&self, to: &str) -> Result<(), ClientError>;
}

#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn notify_escalation(&self, event: &EscalationEvent) -> Result<(), ClientError>;
}

/// Wraps any fallible async call with `breaker.before_call()` +
/// `retry_with_backoff`, recording success/failure on the breaker as the
/// retry loop observes outcomes. This is the `protected(op) = retry(circuit(op))`
/// composition every client method below funnels through.
pub async fn protected<T, F, Fut>(
    breaker: &CircuitBreaker,
    retry_config: RetryConfig,
    operation_name: &str,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClientError>>,
{
    breaker.before_call().await?;

    let started = Instant::now();
    let result = retry_with_backoff(retry_config, operation_name, ClientError::is_retryable, || op()).await;
    breaker.record_latency(started.elapsed().as_millis() as u64).await;

    match &result {
        Ok(_) => breaker.record_success().await,
        Err(e) if e.is_retryable() => breaker.record_failure().await,
        Err(_) => {}
    }
    result
}

pub struct HttpTenantDataClient {
    http: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
    retry_config: RetryConfig,
}

impl HttpTenantDataClient {
    pub fn new(base_url: String, timeout: Duration, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(timeout).build().expect("client config is valid"),
            base_url,
            breaker,
            retry_config: RetryConfig::external_service_config(),
        }
    }
}

#[async_trait]
impl TenantDataClient for HttpTenantDataClient {
    async fn get_tenant_profile(&self, tenant_id: &str) -> Result<TenantProfile, ClientError> {
        protected(&self.breaker, self.retry_config, "tenant_data.get_profile", || async {
            self.http
                .get(format!("{}/tenants/{}", self.base_url, tenant_id))
                .send()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?
                .json::<TenantProfile>()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))
        })
        .await
    }
}

pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
    retry_config: RetryConfig,
}

impl HttpLlmClient {
    pub fn new(base_url: String, timeout: Duration, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(timeout).build().expect("client config is valid"),
            base_url,
            breaker,
            retry_config: RetryConfig::external_service_config(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: &LlmCompletionRequest) -> Result<LlmCompletionResponse, ClientError> {
        protected(&self.breaker, self.retry_config, "llm.complete", || async {
            self.http
                .post(format!("{}/v1/completions", self.base_url))
                .json(request)
                .send()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?
                .json::<LlmCompletionResponse>()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))
        })
        .await
    }
}

pub struct HttpSmsGatewayClient {
    http: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
    retry_config: RetryConfig,
}

impl HttpSmsGatewayClient {
    pub fn new(base_url: String, timeout: Duration, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(timeout).build().expect("client config is valid"),
            base_url,
            breaker,
            retry_config: RetryConfig::external_service_config(),
        }
    }
}

#[derive(Serialize)]
struct SmsSendBody<'a> {
    to: &'a str,
    body: &'a str,
}

#[async_trait]
impl SmsGatewayClient for HttpSmsGatewayClient {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), ClientError> {
        protected(&self.breaker, self.retry_config, "sms_gateway.send", || async {
            self.http
                .post(format!("{}/messages", self.base_url))
                .json(&SmsSendBody { to, body })
                .send()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?
                .error_for_status()
                .map_err(|e| ClientError::Request(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn pause_messaging(&self, to: &str) -> Result<(), ClientError> {
        protected(&self.breaker, self.retry_config, "sms_gateway.pause", || async {
            self.http
                .post(format!("{}/messages/pause", self.base_url))
                .json(&PauseMessagingBody { to })
                .send()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?
                .error_for_status()
                .map_err(|e| ClientError::Request(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

#[derive(Serialize)]
struct PauseMessagingBody<'a> {
    to: &'a str,
}

pub struct HttpNotificationClient {
    http: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
    retry_config: RetryConfig,
}

impl HttpNotificationClient {
    pub fn new(base_url: String, timeout: Duration, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(timeout).build().expect("client config is valid"),
            base_url,
            breaker,
            retry_config: RetryConfig::default_config(),
        }
    }
}

#[async_trait]
impl NotificationClient for HttpNotificationClient {
    async fn notify_escalation(&self, event: &EscalationEvent) -> Result<(), ClientError> {
        protected(&self.breaker, self.retry_config, "notifications.escalation", || async {
            self.http
                .post(format!("{}/notifications/escalation", self.base_url))
                .json(event)
                .send()
                .await
                .map_err(|e| ClientError::Request(e.to_string()))?
                .error_for_status()
                .map_err(|e| ClientError::Request(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn protected_retries_transient_failures_then_succeeds() {
        let breaker = Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::default()));
        let retry_config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
        };
        let calls = AtomicU32::new(0);

        let result: Result<u32, ClientError> =
            protected(&breaker, retry_config, "test_op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err(ClientError::Request("transient".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn protected_rejects_immediately_when_breaker_open() {
        let breaker = Arc::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                open_timeout_ms: 60_000,
                half_open_max_calls: 1,
            },
        ));
        breaker.before_call().await.ok();
        breaker.record_failure().await;

        let retry_config = RetryConfig::default_config();
        let result: Result<u32, ClientError> =
            protected(&breaker, retry_config, "test_op", || async { Ok(1) }).await;

        assert!(matches!(result, Err(ClientError::CircuitOpen(_))));
    }
}
