//! Agent 执行契约
//!
//! 给定组装好的上下文，agent 返回：符合 Schema 的产出、澄清请求（中断）、委派，
//! 或抛出已分类的错误。

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::AgentContext;
use crate::core::AgentError;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// 最终产出，写入 deliverables[agent_id]
    Deliverable(Value),
    /// 需要用户输入；payload 原样展示给用户
    Clarify(Value),
    /// 把子任务交给另一个 agent，完成后回到自己
    Delegate { target: String, task: String },
    /// 保持自己为 active_agent，下一步再次运行
    Retain { note: Option<String> },
    /// 任务本身无法完成
    Failed { reason: String },
}

impl AgentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentOutcome::Deliverable(_) => "deliverable",
            AgentOutcome::Clarify(_) => "clarify",
            AgentOutcome::Delegate { .. } => "delegate",
            AgentOutcome::Retain { .. } => "retain",
            AgentOutcome::Failed { .. } => "failed",
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, ctx: &mut AgentContext) -> Result<AgentOutcome, AgentError>;
}
