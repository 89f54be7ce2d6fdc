//! 计划-执行-反思控制器
//!
//! 控制器是 ReAct 图的枢纽：首次进入时生成计划；之后每次从 agent 返回，读取 last_status
//! 更新当前任务，再决定派发下一个任务、快速重试、反思或结束。一次只派发一个任务。
//!
//! - 系统失败：不经反思，最多快速重试 max_error_retries 次；耗尽则计划失败
//! - 业务失败，或计划已无待办任务：请求 LLM 反思，决定 continue / retry / replan / end

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{AgentError, ExecutionStatus, FailureKind, OrchestratorError};
use crate::events::EventType;
use crate::graph::planning::{emit_plan_update, initial_plan, roster, valid_drafts};
use crate::graph::{Node, NodeEnv, NodeOutcome};
use crate::llm::{parse_json, LlmRequest};
use crate::memory::{Message, TimelineDraft};
use crate::state::{Blackboard, Plan, StatePatch, TaskDraft};

pub const CONTROLLER: &str = "controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReflectDecision {
    Continue,
    Retry,
    Replan,
    End,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct Reflection {
    pub decision: ReflectDecision,
    #[serde(default)]
    pub reason: String,
    /// replan 时的新任务
    #[serde(default)]
    pub tasks: Vec<TaskDraft>,
}

pub struct ControllerNode;

impl ControllerNode {
    /// 派发一个任务给它的 agent
    fn dispatch(&self, env: &NodeEnv, mut plan: Plan, task_id: &str) -> NodeOutcome {
        let Some(task) = plan.task_mut(task_id) else {
            return self.finish(env, plan, "task vanished from plan");
        };
        task.status = ExecutionStatus::Running;
        let agent = task.agent_id.clone();
        let description = task.description.clone();
        plan.current_task_id = Some(task_id.to_string());
        tracing::info!(task = %task_id, agent = %agent, "dispatch");
        emit_plan_update(env, &plan, "dispatch");
        let patch = StatePatch::new()
            .activate(agent.clone())
            .task(Some(description.clone()))
            .status(ExecutionStatus::Running)
            .clear_failure()
            .message(Message::assistant(format!("[DISPATCH] {task_id} -> {agent}: {description}")).named(CONTROLLER))
            .record(
                TimelineDraft::new(EventType::PlanUpdate, format!("dispatch {task_id} to {agent}"))
                    .metadata(json!({ "task_id": task_id })),
            )
            .plan(Some(plan));
        NodeOutcome::Goto(patch, agent)
    }

    /// 结束计划：未执行的任务记为 skipped；存在失败任务时计划失败
    fn finish(&self, env: &NodeEnv, mut plan: Plan, reason: &str) -> NodeOutcome {
        plan.current_task_id = None;
        for task in plan.tasks.iter_mut() {
            if !task.status.is_terminal() {
                task.status = ExecutionStatus::Skipped;
            }
        }
        let failed = plan.has_failed();
        plan.status = if failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        emit_plan_update(env, &plan, reason);
        tracing::info!(status = %plan.status, reason, "plan finished");

        let results: Vec<Value> = plan
            .tasks
            .iter()
            .map(|t| json!({ "id": t.id, "agent": t.agent_id, "status": t.status, "output": t.output, "error": t.error }))
            .collect();
        let patch = StatePatch::new()
            .deliverable(CONTROLLER, json!({ "goal": plan.goal, "status": plan.status, "reason": reason, "tasks": results }))
            .deactivate()
            .task(None)
            .record(TimelineDraft::new(EventType::PlanUpdate, format!("plan {}: {reason}", plan.status)));
        let patch = if failed {
            patch.failure(FailureKind::Business, format!("plan failed: {reason}"))
        } else {
            patch.status(ExecutionStatus::Completed).clear_failure()
        };
        NodeOutcome::End(patch.plan(Some(plan)))
    }

    /// 下一个待办任务，没有则反思
    async fn advance(&self, board: &Blackboard, env: &NodeEnv, plan: Plan) -> NodeOutcome {
        match plan.next_pending().map(|t| t.id.clone()) {
            Some(next) => self.dispatch(env, plan, &next),
            None => self.reflect(board, env, plan).await,
        }
    }

    async fn reflect(&self, board: &Blackboard, env: &NodeEnv, mut plan: Plan) -> NodeOutcome {
        let reflection = match self.request_reflection(board, env, &plan).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "reflection unparseable, ending");
                return self.finish(env, plan, "reflection failed");
            }
        };
        tracing::info!(decision = ?reflection.decision, reason = %reflection.reason, "reflection");

        match reflection.decision {
            ReflectDecision::Continue => match plan.next_pending().map(|t| t.id.clone()) {
                Some(next) => self.dispatch(env, plan, &next),
                None => self.finish(env, plan, &reflection.reason),
            },
            ReflectDecision::Retry => {
                let failed = plan
                    .tasks
                    .iter()
                    .rev()
                    .find(|t| t.status == ExecutionStatus::Failed)
                    .map(|t| t.id.clone());
                match failed {
                    Some(id) if plan.error_retry_count < env.settings.max_error_retries => {
                        plan.error_retry_count += 1;
                        if let Some(task) = plan.task_mut(&id) {
                            task.reset();
                        }
                        self.dispatch(env, plan, &id)
                    }
                    Some(_) => self.finish(env, plan, "retry limit reached"),
                    None => self.advance_or_finish(env, plan, &reflection.reason),
                }
            }
            ReflectDecision::Replan => {
                if plan.replan_count >= env.settings.max_replan_depth {
                    return self.finish(env, plan, "replan limit reached");
                }
                let drafts = valid_drafts(&env.registry, reflection.tasks);
                if drafts.is_empty() {
                    return self.finish(env, plan, "replan produced no valid task");
                }
                plan.revise(drafts);
                emit_plan_update(env, &plan, "replanned");
                self.advance_or_finish(env, plan, &reflection.reason)
            }
            ReflectDecision::End => self.finish(env, plan, &reflection.reason),
        }
    }

    fn advance_or_finish(&self, env: &NodeEnv, plan: Plan, reason: &str) -> NodeOutcome {
        match plan.next_pending().map(|t| t.id.clone()) {
            Some(next) => self.dispatch(env, plan, &next),
            None => self.finish(env, plan, reason),
        }
    }

    async fn request_reflection(&self, board: &Blackboard, env: &NodeEnv, plan: &Plan) -> Result<Reflection, AgentError> {
        let schema = serde_json::to_string_pretty(&schema_for!(Reflection)).unwrap_or_default();
        let mut system = format!(
            "You review the progress of a plan and decide the next step.\n\
             - continue: move on to the next pending task (or finish if none)\n\
             - retry: run the most recent failed task again\n\
             - replan: replace every unfinished task with `tasks`\n\
             - end: stop now\n\n## Agents\n{}\n\n{}",
            roster(&env.registry),
            plan.to_prompt()
        );
        if let Some(error) = &board.error {
            system.push_str(&format!("\nLast error: {error}\n"));
        }
        system.push_str(&format!("\n## Reply format\nReply with exactly one JSON object:\n{schema}"));
        let request = LlmRequest::new(vec![
            Message::system(system),
            Message::user(board.goal.clone().unwrap_or_default()),
        ]);
        let response = env.services.llm.complete(&request).await?;
        parse_json(&response.content)
    }
}

#[async_trait]
impl Node for ControllerNode {
    fn name(&self) -> &str {
        CONTROLLER
    }

    async fn execute(&self, board: &Blackboard, env: &NodeEnv) -> Result<NodeOutcome, OrchestratorError> {
        let Some(mut plan) = board.plan.clone() else {
            let goal = board.goal.clone().unwrap_or_default();
            let plan = initial_plan(env, &goal).await;
            emit_plan_update(env, &plan, "planned");
            return Ok(self.advance(board, env, plan).await);
        };
        if plan.status.is_terminal() {
            return Ok(NodeOutcome::End(StatePatch::new()));
        }
        let Some(current) = plan.current().cloned() else {
            return Ok(self.advance(board, env, plan).await);
        };

        let status = board.last_status.unwrap_or(ExecutionStatus::Pending);
        match status {
            ExecutionStatus::Completed => {
                let output = board.deliverable(&current.agent_id).cloned().unwrap_or(Value::Null);
                if let Some(task) = plan.current_mut() {
                    task.complete(output);
                }
                plan.current_task_id = None;
                plan.error_retry_count = 0;
                Ok(self.advance(board, env, plan).await)
            }
            ExecutionStatus::Aborted => Ok(NodeOutcome::End(StatePatch::new())),
            ExecutionStatus::Failed if board.last_failure_kind == Some(FailureKind::System) => {
                if plan.error_retry_count < env.settings.max_error_retries {
                    plan.error_retry_count += 1;
                    tracing::warn!(
                        task = %current.id,
                        attempt = plan.error_retry_count,
                        max = env.settings.max_error_retries,
                        "system failure, retrying task"
                    );
                    if let Some(task) = plan.current_mut() {
                        task.reset();
                    }
                    Ok(self.dispatch(env, plan, &current.id))
                } else {
                    let error = board.error.clone().unwrap_or_else(|| "system failure".into());
                    if let Some(task) = plan.current_mut() {
                        task.fail(error, FailureKind::System);
                    }
                    Ok(self.finish(env, plan, "error retries exhausted"))
                }
            }
            other => {
                let error = match other {
                    ExecutionStatus::Failed => board.error.clone().unwrap_or_else(|| "task failed".into()),
                    _ => format!("agent returned without a result (status {other})"),
                };
                if let Some(task) = plan.current_mut() {
                    task.fail(error, FailureKind::Business);
                }
                plan.current_task_id = None;
                Ok(self.reflect(board, env, plan).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflection_parses_decisions() {
        let r: Reflection = parse_json(r#"{"decision": "replan", "reason": "x", "tasks": [{"agent": "a", "description": "d"}]}"#).unwrap();
        assert_eq!(r.decision, ReflectDecision::Replan);
        assert_eq!(r.tasks.len(), 1);
        let r: Reflection = parse_json(r#"{"decision": "end"}"#).unwrap();
        assert_eq!(r.decision, ReflectDecision::End);
        assert!(parse_json::<Reflection>(r#"{"decision": "maybe"}"#).is_err());
    }
}
