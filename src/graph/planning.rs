//! 规划辅助：map-reduce 规划器与 ReAct 控制器共用
//!
//! 让 LLM 把目标拆成 `{agent, description}` 任务；未知 agent 的任务被丢弃，
//! 一个有效任务都没有时退回“每个 agent 一个任务”。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::json;

use crate::agent::AgentRegistry;
use crate::core::AgentError;
use crate::events::EventType;
use crate::graph::NodeEnv;
use crate::llm::{parse_json, LlmRequest};
use crate::memory::Message;
use crate::state::{Plan, TaskDraft};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlanDraft {
    pub tasks: Vec<TaskDraft>,
}

/// 可选 agent 列表（id: 描述）
pub fn roster(registry: &AgentRegistry) -> String {
    registry
        .entries()
        .iter()
        .map(|e| {
            let description = if e.spec.description.is_empty() {
                e.spec.name.as_str()
            } else {
                e.spec.description.as_str()
            };
            format!("- {}: {}", e.spec.id, description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn fallback_plan(registry: &AgentRegistry, goal: &str) -> Vec<TaskDraft> {
    registry
        .ids()
        .into_iter()
        .map(|agent| TaskDraft {
            agent,
            description: goal.to_string(),
        })
        .collect()
}

/// 丢弃指向未注册 agent 的任务
pub fn valid_drafts(registry: &AgentRegistry, drafts: Vec<TaskDraft>) -> Vec<TaskDraft> {
    drafts
        .into_iter()
        .filter(|d| {
            let known = registry.contains(&d.agent);
            if !known {
                tracing::warn!(agent = %d.agent, "planner referenced unknown agent, task dropped");
            }
            known
        })
        .collect()
}

/// 请求 LLM 给出任务列表；解析失败返回错误，由调用方决定是否回退
pub async fn request_drafts(
    env: &NodeEnv,
    goal: &str,
    extra_context: Option<&str>,
) -> Result<Vec<TaskDraft>, AgentError> {
    let schema = serde_json::to_string_pretty(&schema_for!(PlanDraft)).unwrap_or_default();
    let mut system = format!(
        "You are a planner. Split the user's goal into an ordered list of tasks, each bound to one agent.\n\
         ## Agents\n{}\n\n## Reply format\nReply with exactly one JSON object:\n{schema}",
        roster(&env.registry)
    );
    if let Some(extra) = extra_context {
        system.push_str("\n\n");
        system.push_str(extra);
    }
    let request = LlmRequest::new(vec![Message::system(system), Message::user(goal)]);
    let response = env.services.llm.complete(&request).await?;
    let draft: PlanDraft = parse_json(&response.content)?;
    Ok(valid_drafts(&env.registry, draft.tasks))
}

/// 生成初始计划；LLM 失败或没有有效任务时回退
pub async fn initial_plan(env: &NodeEnv, goal: &str) -> Plan {
    let drafts = match request_drafts(env, goal, None).await {
        Ok(drafts) if !drafts.is_empty() => drafts,
        Ok(_) => {
            tracing::warn!("planner produced no valid task, falling back to one task per agent");
            fallback_plan(&env.registry, goal)
        }
        Err(e) => {
            tracing::warn!(error = %e, "planning failed, falling back to one task per agent");
            fallback_plan(&env.registry, goal)
        }
    };
    Plan::new(goal, drafts)
}

/// plan.update 事件
pub fn emit_plan_update(env: &NodeEnv, plan: &Plan, reason: &str) {
    tracing::info!(
        tasks = plan.tasks.len(),
        status = %plan.status,
        replans = plan.replan_count,
        reason,
        "plan update"
    );
    env.emitter.emit(
        env.emitter
            .event(EventType::PlanUpdate)
            .with_data(json!({ "reason": reason, "plan": plan })),
    );
}
