//! 限流：每个 LLM provider 一个实例，同时限制每分钟请求数与并发数
//!
//! rpm 按固定间隔发放请求槽位（60s / rpm），不允许空闲后突发；
//! max_concurrent 用信号量，许可随 `RatePermit` 释放。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// 每分钟请求数；0 表示不限
    pub rpm: u32,
    pub max_concurrent: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpm: 60,
            max_concurrent: 10,
        }
    }
}

/// 持有期间占用一个并发名额
#[derive(Debug)]
pub struct RatePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
pub struct RateLimiter {
    provider: String,
    config: RateLimitConfig,
    semaphore: Arc<Semaphore>,
    /// 下一个可用的请求槽位
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(provider: impl Into<String>, config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            max_concurrent: config.max_concurrent.max(1),
            ..config
        };
        Self {
            provider: provider.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            next_slot: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn interval(&self) -> Option<Duration> {
        (self.config.rpm > 0).then(|| Duration::from_secs(60) / self.config.rpm)
    }

    /// 等到并发名额与请求槽位都就绪
    pub async fn acquire(&self) -> RatePermit {
        let permit = self.semaphore.clone().acquire_owned().await.ok();
        if let Some(interval) = self.interval() {
            let slot = {
                let now = Instant::now();
                let mut next = self.next_slot.lock();
                let slot = next.map_or(now, |n| n.max(now));
                *next = Some(slot + interval);
                slot
            };
            let now = Instant::now();
            if slot > now {
                tracing::debug!(provider = %self.provider, wait_ms = (slot - now).as_millis() as u64, "rate limited");
                tokio::time::sleep_until(slot).await;
            }
        }
        RatePermit { _permit: permit }
    }
}
