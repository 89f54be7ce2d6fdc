//! 熔断器
//!
//! 每个依赖（LLM 后端、单个工具）一个状态机：
//! closed --N 次连续失败--> open --恢复超时--> half_open --成功--> closed / --失败--> open。
//! open 期间调用直接返回 circuit_open 错误，不触达底层依赖；half_open 只放行一个探测请求。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::core::{AgentError, ClassifiedError, ErrorCategory};

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前状态；open 且已过恢复超时时转为 half_open
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.recovery_timeout {
                tracing::info!(breaker = %self.name, "circuit half-open");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = false;
            }
        }
    }

    /// 申请一次调用许可
    pub fn try_acquire(&self) -> Result<(), ClassifiedError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(())
            }
            _ => Err(ClassifiedError::new(
                ErrorCategory::CircuitOpen,
                format!("circuit '{}' is open", self.name),
            )),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(breaker = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            tracing::warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
        inner.probe_in_flight = false;
    }

    /// 受熔断保护地执行 op；只有系统类错误计入失败
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        self.try_acquire().map_err(AgentError::Llm)?;
        match op().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                if e.category().trips_breaker() {
                    self.record_failure();
                } else {
                    // 依赖有响应，只是请求本身有问题
                    self.record_success();
                }
                Err(e)
            }
        }
    }
}

/// 按依赖名管理熔断器，由运行时构建一次并注入
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config.clone())))
            .clone()
    }

    /// 各依赖当前状态（用于会话统计与排障）
    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .lock()
            .iter()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect()
    }
}
