//! 弹性层：指数退避重试、按依赖划分的熔断器与 LLM 限流，包裹所有 LLM / 工具调用

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use rate_limit::{RateLimitConfig, RateLimiter, RatePermit};
pub use retry::RetryPolicy;
