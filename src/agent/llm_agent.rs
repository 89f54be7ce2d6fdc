//! 通用 LLM agent
//!
//! 组装上下文 -> 调用 LLM -> 按 JSON 协议解析回复：
//! `{"tool":..,"args":..}` 执行工具并把结果写回上下文后继续（最多 max_steps 步），
//! `{"delegate":{..}}` / `{"clarify":{..}}` / `{"deliverable":{..}}` 结束本回合，
//! 纯文本视为产出。

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::{Agent, AgentContext, AgentOutcome};
use crate::core::{AgentError, ErrorCategory};
use crate::llm::extract_json_str;
use crate::memory::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    Tool { tool: String, args: Value },
    Delegate { target: String, task: String },
    Clarify(Value),
    Deliverable(Value),
    Text(String),
}

impl AgentReply {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentReply::Tool { .. } => "tool",
            AgentReply::Delegate { .. } => "delegate",
            AgentReply::Clarify(_) => "clarify",
            AgentReply::Deliverable(_) => "deliverable",
            AgentReply::Text(_) => "text",
        }
    }
}

/// 解析一条助手回复
pub fn parse_reply(content: &str) -> AgentReply {
    let trimmed = content.trim();
    let Some(value) = extract_json_str(trimmed).and_then(|s| serde_json::from_str::<Value>(s).ok())
    else {
        return AgentReply::Text(trimmed.to_string());
    };
    if let Some(tool) = value.get("tool").and_then(|t| t.as_str()) {
        let args = value.get("args").cloned().unwrap_or(Value::Object(Default::default()));
        return AgentReply::Tool {
            tool: tool.trim().to_string(),
            args,
        };
    }
    if let Some(d) = value.get("delegate") {
        let field = |k: &str| d.get(k).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        return AgentReply::Delegate {
            target: field("target"),
            task: field("task"),
        };
    }
    if let Some(c) = value.get("clarify") {
        return AgentReply::Clarify(c.clone());
    }
    if let Some(d) = value.get("deliverable") {
        return AgentReply::Deliverable(d.clone());
    }
    AgentReply::Deliverable(value)
}

/// 工具错误中可以反馈给模型、让它自行修正的那部分
fn recoverable_tool_error(err: &AgentError) -> bool {
    matches!(
        err.category(),
        ErrorCategory::InvalidInput | ErrorCategory::NotFound | ErrorCategory::Internal
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LlmAgent;

impl LlmAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for LlmAgent {
    async fn run(&self, ctx: &mut AgentContext) -> Result<AgentOutcome, AgentError> {
        let max_steps = ctx.spec().max_steps.max(1);
        for step in 0..max_steps {
            let resp = ctx.chat().await?;

            // 原生工具调用优先于文本协议
            let reply = match resp.tool_calls.first() {
                Some(call) => AgentReply::Tool {
                    tool: call.name.clone(),
                    args: call.arguments.clone(),
                },
                None => parse_reply(&resp.content),
            };
            tracing::debug!(agent = %ctx.agent_id(), step, kind = reply.kind(), "agent reply");

            match reply {
                AgentReply::Tool { tool, args } => {
                    let name = ctx.agent_id().to_string();
                    ctx.push_turn(Message::assistant(resp.content.clone()).named(name));
                    match ctx.call_tool(&tool, args).await {
                        Ok(_) => {}
                        Err(e) if recoverable_tool_error(&e) => {
                            ctx.push_turn(Message::tool(tool, format!("error: {e}")));
                        }
                        Err(e) => return Err(e),
                    }
                }
                AgentReply::Delegate { target, task } => return ctx.delegate(target, task),
                AgentReply::Clarify(payload) => return Ok(AgentOutcome::Clarify(payload)),
                AgentReply::Deliverable(value) => return Ok(AgentOutcome::Deliverable(value)),
                AgentReply::Text(text) => return Ok(AgentOutcome::Deliverable(Value::String(text))),
            }
        }
        Err(AgentError::StructuredOutput(format!(
            "agent '{}' produced no deliverable within {max_steps} steps",
            ctx.agent_id()
        )))
    }
}
