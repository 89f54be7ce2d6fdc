//! 并行拓扑：depends_on 分层（Kahn 算法）、层节点、map-reduce 的规划器与归约器
//!
//! 层内 agent 并发运行（受 TaskScheduler 许可限制），全部结束后按层内顺序一次性合并；
//! 层与层严格先后执行。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::agent::{AgentOutcome, AgentRegistry, AgentSpec};
use crate::core::{AgentError, ExecutionStatus, FailureKind, OrchestratorError};
use crate::events::EventType;
use crate::graph::agent_node::{emit_agent_end, run_turn, TurnResult};
use crate::graph::planning::{emit_plan_update, initial_plan};
use crate::graph::{Node, NodeEnv, NodeOutcome};
use crate::memory::{Message, TimelineDraft};
use crate::state::{Blackboard, StatePatch};

pub const PLANNER: &str = "planner";
pub const REDUCER: &str = "reducer";

pub fn layer_name(index: usize) -> String {
    format!("layer_{index}")
}

/// 按 depends_on 拓扑分层；同层内保持注册顺序。存在环时返回 CyclicDependency（列出环上及其下游的 agent）
pub fn topological_layers(registry: &AgentRegistry) -> Result<Vec<Vec<String>>, OrchestratorError> {
    let ids = registry.ids();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for id in &ids {
        adjacency.entry(id.as_str()).or_default();
        in_degree.entry(id.as_str()).or_insert(0);
    }
    for entry in registry.entries() {
        for dep in &entry.spec.depends_on {
            if !registry.contains(dep) {
                return Err(OrchestratorError::UnknownAgent(dep.clone()));
            }
            adjacency.entry(dep.as_str()).or_default().push(entry.spec.id.as_str());
            *in_degree.entry(entry.spec.id.as_str()).or_insert(0) += 1;
        }
    }

    let order: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let mut ready: VecDeque<&str> = ids
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();
    let mut layers = Vec::new();
    let mut placed = 0;

    while !ready.is_empty() {
        let mut layer: Vec<&str> = ready.drain(..).collect();
        layer.sort_by_key(|id| order.get(id).copied().unwrap_or(usize::MAX));
        let mut next = Vec::new();
        for id in &layer {
            if let Some(dependents) = adjacency.get(id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
        }
        placed += layer.len();
        layers.push(layer.into_iter().map(str::to_string).collect());
        ready.extend(next);
    }

    if placed < ids.len() {
        let stuck: Vec<String> = ids
            .iter()
            .filter(|id| in_degree.get(id.as_str()).copied().unwrap_or(0) > 0)
            .cloned()
            .collect();
        return Err(OrchestratorError::CyclicDependency(stuck));
    }
    Ok(layers)
}

/// 层内一个工作项：agent 与其任务（map-reduce 下关联计划任务 id）
struct WorkItem {
    agent_id: String,
    task_id: Option<String>,
    description: String,
}

struct WorkResult {
    index: usize,
    agent_id: String,
    task_id: Option<String>,
    result: Result<TurnResult, AgentError>,
}

/// 并行层：同层 agent 并发执行
pub struct LayerNode {
    name: String,
    agents: Vec<String>,
    /// true 时按计划任务派发，产出写回计划而不是 deliverables
    map_reduce: bool,
}

impl LayerNode {
    pub fn new(index: usize, agents: Vec<String>, map_reduce: bool) -> Self {
        Self {
            name: layer_name(index),
            agents,
            map_reduce,
        }
    }

    fn work_items(&self, board: &Blackboard) -> Vec<WorkItem> {
        if self.map_reduce {
            let Some(plan) = &board.plan else {
                return Vec::new();
            };
            plan.tasks
                .iter()
                .filter(|t| t.status == ExecutionStatus::Pending && self.agents.contains(&t.agent_id))
                .map(|t| WorkItem {
                    agent_id: t.agent_id.clone(),
                    task_id: Some(t.id.clone()),
                    description: t.description.clone(),
                })
                .collect()
        } else {
            let goal = board.goal.clone().unwrap_or_default();
            self.agents
                .iter()
                .map(|a| WorkItem {
                    agent_id: a.clone(),
                    task_id: None,
                    description: goal.clone(),
                })
                .collect()
        }
    }

    async fn run_items(&self, board: &Blackboard, env: &NodeEnv, items: Vec<WorkItem>) -> Vec<WorkResult> {
        let mut set = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let spec: Option<Arc<AgentSpec>> = env.registry.spec(&item.agent_id).cloned();
            let env = env.clone();
            let view = board.clone();
            set.spawn(async move {
                let result = match spec {
                    None => Err(AgentError::Business(format!("agent '{}' is not registered", item.agent_id))),
                    Some(spec) => {
                        let _permit = env.scheduler.acquire().await;
                        if env.cancel.is_cancelled() {
                            Err(AgentError::Cancelled)
                        } else {
                            let result =
                                run_turn(&env, spec.clone(), view, Some(item.description.clone()), Vec::new()).await;
                            if let Ok(turn) = &result {
                                emit_agent_end(
                                    &env,
                                    &spec,
                                    &turn.run_id,
                                    turn.duration_ms,
                                    json!({ "outcome": turn.outcome.as_str(), "task_id": item.task_id }),
                                );
                            }
                            result
                        }
                    }
                };
                WorkResult {
                    index,
                    agent_id: item.agent_id,
                    task_id: item.task_id,
                    result,
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => tracing::error!(layer = %self.name, error = %e, "layer task panicked"),
            }
        }
        // 合并按层内顺序进行，与完成先后无关
        results.sort_by_key(|r| r.index);
        results
    }

    fn result_message(agent_id: &str, status: ExecutionStatus) -> Message {
        Message::assistant(format!("[RESULT] agent={agent_id} status={status}")).named(agent_id.to_string())
    }

    /// 普通并行：每个 agent 写 deliverables[agent]；任何失败在全层结束后终止运行
    fn merge_parallel(&self, board: &Blackboard, env: &NodeEnv, results: Vec<WorkResult>) -> Result<NodeOutcome, OrchestratorError> {
        let mut patches = Vec::new();
        let mut failures: Vec<(String, String, FailureKind)> = Vec::new();
        let reported: Vec<String> = results.iter().map(|r| r.agent_id.clone()).collect();

        for r in results {
            match r.result {
                Ok(turn) => match turn.outcome {
                    AgentOutcome::Deliverable(value) => {
                        let version = board.deliverable_version(&r.agent_id) + 1;
                        let patch = turn
                            .patch
                            .deliverable(r.agent_id.clone(), value)
                            .message(
                                Message::assistant(format!(
                                    "[RESULT] agent={0} status=completed deliverable={0}:v{version}",
                                    r.agent_id
                                ))
                                .named(r.agent_id.clone()),
                            )
                            .record(
                                TimelineDraft::new(EventType::AgentEnd, format!("completed, deliverable v{version}"))
                                    .agent(r.agent_id.clone())
                                    .duration(turn.duration_ms),
                            );
                        patches.push((r.agent_id, patch));
                    }
                    AgentOutcome::Failed { reason } => {
                        failures.push((r.agent_id, reason, FailureKind::Business));
                    }
                    other => {
                        failures.push((
                            r.agent_id,
                            format!("'{}' is not supported inside a parallel layer", other.as_str()),
                            FailureKind::Business,
                        ));
                    }
                },
                Err(e) => failures.push((r.agent_id, e.to_string(), e.failure_kind())),
            }
        }
        for agent in &self.agents {
            if !reported.contains(agent) {
                failures.push((agent.clone(), "task did not complete".into(), FailureKind::System));
            }
        }

        let mut patch = StatePatch::merge_layer(patches, env.settings.overlap_policy)?;
        if failures.is_empty() {
            return Ok(NodeOutcome::Continue(
                patch.status(ExecutionStatus::Completed).clear_failure().deactivate(),
            ));
        }

        let kind = if failures.iter().any(|(_, _, k)| *k == FailureKind::System) {
            FailureKind::System
        } else {
            FailureKind::Business
        };
        let summary = failures
            .iter()
            .map(|(agent, reason, _)| format!("{agent}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ");
        for (agent, reason, _) in &failures {
            tracing::warn!(layer = %self.name, agent = %agent, reason = %reason, "parallel agent failed");
            patch = patch
                .message(Self::result_message(agent, ExecutionStatus::Failed))
                .record(TimelineDraft::new(EventType::AgentFailed, reason.clone()).agent(agent.clone()));
        }
        Ok(NodeOutcome::End(patch.failure(kind, summary).deactivate()))
    }

    /// map-reduce：结果写回计划任务；单个任务失败不影响兄弟任务
    fn merge_map(&self, board: &Blackboard, env: &NodeEnv, results: Vec<WorkResult>) -> Result<NodeOutcome, OrchestratorError> {
        let Some(mut plan) = board.plan.clone() else {
            return Ok(NodeOutcome::Continue(StatePatch::new()));
        };
        let mut patches = Vec::new();
        let mut reported = Vec::new();

        for r in results {
            let Some(task_id) = r.task_id else { continue };
            reported.push(task_id.clone());
            let Some(task) = plan.task_mut(&task_id) else { continue };
            match r.result {
                Ok(turn) => {
                    let status = match turn.outcome {
                        AgentOutcome::Deliverable(value) => {
                            task.complete(value);
                            ExecutionStatus::Completed
                        }
                        AgentOutcome::Failed { reason } => {
                            task.fail(reason, FailureKind::Business);
                            ExecutionStatus::Failed
                        }
                        other => {
                            task.fail(
                                format!("'{}' is not supported inside a parallel layer", other.as_str()),
                                FailureKind::Business,
                            );
                            ExecutionStatus::Failed
                        }
                    };
                    let patch = turn
                        .patch
                        .message(Self::result_message(&r.agent_id, status))
                        .record(
                            TimelineDraft::new(EventType::AgentEnd, format!("{task_id} {status}"))
                                .agent(r.agent_id.clone())
                                .duration(turn.duration_ms),
                        );
                    patches.push((r.agent_id, patch));
                }
                Err(e) => {
                    tracing::warn!(layer = %self.name, agent = %r.agent_id, task = %task_id, error = %e, "map task failed");
                    task.fail(e.to_string(), e.failure_kind());
                    patches.push((
                        r.agent_id.clone(),
                        StatePatch::new()
                            .message(Self::result_message(&r.agent_id, ExecutionStatus::Failed))
                            .record(TimelineDraft::new(EventType::AgentFailed, e.to_string()).agent(r.agent_id)),
                    ));
                }
            }
        }
        for task in plan.tasks.iter_mut() {
            if task.status == ExecutionStatus::Pending
                && self.agents.contains(&task.agent_id)
                && !reported.contains(&task.id)
            {
                task.fail("task did not complete", FailureKind::System);
            }
        }

        let patch = StatePatch::merge_layer(patches, env.settings.overlap_policy)?;
        emit_plan_update(env, &plan, &format!("{} finished", self.name));
        Ok(NodeOutcome::Continue(patch.plan(Some(plan)).status(ExecutionStatus::Running)))
    }
}

#[async_trait]
impl Node for LayerNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, board: &Blackboard, env: &NodeEnv) -> Result<NodeOutcome, OrchestratorError> {
        let items = self.work_items(board);
        if items.is_empty() {
            return Ok(NodeOutcome::Continue(StatePatch::new()));
        }
        tracing::info!(layer = %self.name, agents = ?self.agents, tasks = items.len(), "layer start");
        let results = self.run_items(board, env, items).await;

        if env.cancel.is_cancelled() {
            // 中止：在途任务已结束，结果丢弃
            tracing::info!(layer = %self.name, "layer results discarded after abort");
            return Ok(NodeOutcome::End(StatePatch::new()));
        }
        if self.map_reduce {
            self.merge_map(board, env, results)
        } else {
            self.merge_parallel(board, env, results)
        }
    }
}

/// map-reduce 规划节点：把目标拆成绑定 agent 的任务
pub struct PlannerNode;

#[async_trait]
impl Node for PlannerNode {
    fn name(&self) -> &str {
        PLANNER
    }

    async fn execute(&self, board: &Blackboard, env: &NodeEnv) -> Result<NodeOutcome, OrchestratorError> {
        if board.plan.is_some() {
            return Ok(NodeOutcome::Continue(StatePatch::new()));
        }
        let goal = board.goal.clone().unwrap_or_default();
        let plan = initial_plan(env, &goal).await;
        emit_plan_update(env, &plan, "planned");
        let summary = plan
            .tasks
            .iter()
            .map(|t| format!("{}@{}", t.id, t.agent_id))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(NodeOutcome::Continue(
            StatePatch::new()
                .status(ExecutionStatus::Running)
                .record(
                    TimelineDraft::new(EventType::PlanUpdate, format!("planned {} tasks", plan.tasks.len()))
                        .metadata(json!({ "tasks": summary })),
                )
                .plan(Some(plan)),
        ))
    }
}

/// map-reduce 归约节点：汇总全部任务结果（含失败）为一个产出
pub struct ReducerNode;

#[async_trait]
impl Node for ReducerNode {
    fn name(&self) -> &str {
        REDUCER
    }

    async fn execute(&self, board: &Blackboard, env: &NodeEnv) -> Result<NodeOutcome, OrchestratorError> {
        let Some(mut plan) = board.plan.clone() else {
            return Ok(NodeOutcome::End(StatePatch::new()));
        };
        let tasks: Vec<Value> = plan
            .tasks
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "agent": t.agent_id,
                    "status": t.status,
                    "output": t.output,
                    "error": t.error,
                    "failure_kind": t.failure_kind,
                })
            })
            .collect();
        let completed = plan.tasks.iter().filter(|t| t.status == ExecutionStatus::Completed).count();
        let failed = plan.tasks.iter().filter(|t| t.status == ExecutionStatus::Failed).count();
        let deliverable = json!({
            "goal": plan.goal,
            "tasks": tasks,
            "completed": completed,
            "failed": failed,
        });

        let all_failed = !plan.tasks.is_empty() && failed == plan.tasks.len();
        plan.status = if all_failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        emit_plan_update(env, &plan, "reduced");
        tracing::info!(completed, failed, "reduce");

        let version = board.deliverable_version(REDUCER) + 1;
        let mut patch = StatePatch::new()
            .deliverable(REDUCER, deliverable)
            .message(
                Message::assistant(format!(
                    "[RESULT] agent={REDUCER} status={} deliverable={REDUCER}:v{version}",
                    plan.status
                ))
                .named(REDUCER),
            )
            .record(TimelineDraft::new(
                EventType::AgentEnd,
                format!("reduced {completed} completed, {failed} failed"),
            ))
            .deactivate();
        patch = if all_failed {
            patch.failure(FailureKind::Business, "all map tasks failed")
        } else {
            patch.status(ExecutionStatus::Completed).clear_failure()
        };
        Ok(NodeOutcome::End(patch.plan(Some(plan))))
    }
}
