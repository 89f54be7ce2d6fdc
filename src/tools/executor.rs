//! 工具执行器
//!
//! 调用前检查 agent 的工具允许列表；调用时施加超时、按工具名熔断、可重试错误退避重试；
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentError, ClassifiedError, ErrorCategory};
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};
use crate::tools::ToolRegistry;

pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
    retry: RetryPolicy,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ToolExecutor {
    pub fn new(
        registry: ToolRegistry,
        timeout_secs: u64,
        retry: RetryPolicy,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            retry,
            breakers,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 以 agent 身份执行工具；不在允许列表内的调用直接拒绝
    pub async fn execute(
        &self,
        agent_id: &str,
        allowed: &[String],
        tool_name: &str,
        args: Value,
    ) -> Result<String, AgentError> {
        if !allowed.iter().any(|t| t == tool_name) {
            return Err(AgentError::ToolNotAllowed {
                tool: tool_name.to_string(),
                agent: agent_id.to_string(),
            });
        }
        let tool = self.registry.get(tool_name).ok_or_else(|| AgentError::Tool {
            tool: tool_name.to_string(),
            source: ClassifiedError::new(ErrorCategory::NotFound, format!("Unknown tool: {tool_name}")),
        })?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let breaker = self.breakers.get(&format!("tool:{tool_name}"));

        let result = self
            .retry
            .run(tool_name, |_| {
                let tool = tool.clone();
                let args = args.clone();
                let breaker = breaker.clone();
                async move {
                    breaker
                        .call(|| async {
                            match timeout(self.timeout, tool.execute(args)).await {
                                Ok(Ok(out)) => Ok(out),
                                Ok(Err(e)) => Err(AgentError::Tool {
                                    tool: tool_name.to_string(),
                                    source: e,
                                }),
                                Err(_) => Err(AgentError::Tool {
                                    tool: tool_name.to_string(),
                                    source: ClassifiedError::new(
                                        ErrorCategory::Timeout,
                                        format!("tool timed out after {}s", self.timeout.as_secs()),
                                    ),
                                }),
                            }
                        })
                        .await
                }
            })
            .await;

        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.category().to_string(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "agent": agent_id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");

        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _args: Value) -> Result<String, ClassifiedError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok("late".into())
        }
    }

    fn executor() -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(SlowTool);
        ToolExecutor::new(
            reg,
            1,
            RetryPolicy::none(),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_allowed_tool_runs() {
        let out = executor()
            .execute("analyst", &["echo".into()], "echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn test_tool_outside_allow_list_rejected() {
        let err = executor()
            .execute("analyst", &[], "echo", json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolNotAllowed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_classified() {
        let err = executor()
            .execute("analyst", &["slow".into()], "slow", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_tool_not_found() {
        let err = executor()
            .execute("analyst", &["ghost".into()], "ghost", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }
}
