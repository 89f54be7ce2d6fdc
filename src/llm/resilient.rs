//! 弹性装饰器：超时 + 重试 + 熔断 + 限流包裹任意 LlmClient
//!
//! 重试在外、熔断在内：熔断打开后返回 circuit_open（快速失败），重试随即停止。
//! 限流在熔断之内，每次真实请求（含重试）占一个槽位；等待时间不计入超时。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{AgentError, ClassifiedError, ErrorCategory};
use crate::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::resilience::{CircuitBreaker, RateLimiter, RetryPolicy};

pub struct ResilientLlmClient {
    inner: Arc<dyn LlmClient>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    limiter: Option<Arc<RateLimiter>>,
}

impl ResilientLlmClient {
    pub fn new(
        inner: Arc<dyn LlmClient>,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            retry,
            breaker,
            timeout,
            limiter: None,
        }
    }

    pub fn with_rate_limit(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    async fn attempt(&self, request: &LlmRequest) -> Result<LlmResponse, AgentError> {
        self.breaker
            .call(|| async {
                let _permit = match &self.limiter {
                    Some(limiter) => Some(limiter.acquire().await),
                    None => None,
                };
                match tokio::time::timeout(self.timeout, self.inner.complete(request)).await {
                    Ok(Ok(resp)) => Ok(resp),
                    Ok(Err(e)) => Err(AgentError::Llm(e)),
                    Err(_) => Err(AgentError::Llm(ClassifiedError::new(
                        ErrorCategory::Timeout,
                        format!("LLM call exceeded {}s", self.timeout.as_secs()),
                    ))),
                }
            })
            .await
    }
}

#[async_trait]
impl LlmClient for ResilientLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ClassifiedError> {
        self.retry
            .run("llm", |_| self.attempt(request))
            .await
            .map_err(|e| match e {
                AgentError::Llm(c) => c,
                other => ClassifiedError::new(other.category(), other.to_string()),
            })
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};

    fn client(llm: Arc<ScriptedLlmClient>, threshold: u32) -> ResilientLlmClient {
        ResilientLlmClient::new(
            llm,
            RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                exponential_base: 2.0,
                jitter: false,
            },
            Arc::new(CircuitBreaker::new(
                "llm",
                CircuitBreakerConfig {
                    failure_threshold: threshold,
                    recovery_timeout: Duration::from_secs(30),
                },
            )),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_then_succeeds() {
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .fail(ClassifiedError::transient("503"))
                .reply("fine"),
        );
        let c = client(llm.clone(), 5);
        let resp = c.complete(&LlmRequest::default()).await.unwrap();
        assert_eq!(resp.content, "fine");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_error_surfaces_without_retry() {
        let llm = Arc::new(ScriptedLlmClient::new().fail(ClassifiedError::context_exceeded("too long")));
        let c = client(llm.clone(), 5);
        let err = c.complete(&LlmRequest::default()).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Context);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retries() {
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .fail(ClassifiedError::transient("503"))
                .fail(ClassifiedError::transient("503"))
                .reply("never reached"),
        );
        let c = client(llm.clone(), 2);
        let err = c.complete(&LlmRequest::default()).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::CircuitOpen);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_for_rate_limit_slots() {
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .fail(ClassifiedError::transient("503"))
                .reply("fine"),
        );
        let limiter = Arc::new(RateLimiter::new("mock", RateLimitConfig { rpm: 6, max_concurrent: 1 }));
        let c = client(llm.clone(), 5).with_rate_limit(limiter.clone());
        let start = tokio::time::Instant::now();
        let resp = c.complete(&LlmRequest::default()).await.unwrap();
        assert_eq!(resp.content, "fine");
        // 6 rpm：第二次尝试要等满 10s 槽位，而不是 10ms 的退避
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(limiter.available(), 1);
    }
}
