//! 重试策略
//!
//! delay = min(initial * base^attempt, max_delay)，开启 jitter 时在 ±25% 内随机浮动，
//! 结果始终落在 [0, max_delay]。只有 RecoveryAction::Retry 的错误会被重试。

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::core::{AgentError, RecoveryAction};

/// 抖动幅度（±25%）
const JITTER_RATIO: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 未加抖动的退避时长
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let raw = self.initial_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        let secs = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// 第 attempt 次重试前的等待时长（attempt 从 0 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let secs = if self.jitter {
            let factor = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
            base * (1.0 + factor)
        } else {
            base
        };
        let max = self.max_delay.as_secs_f64();
        Duration::from_secs_f64(secs.clamp(0.0, max))
    }

    /// 执行 op，可重试错误按退避重试；闭包参数为当前尝试序号
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if e.recovery_action() != RecoveryAction::Retry || attempt >= self.max_retries {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
