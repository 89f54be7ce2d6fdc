//! Agent 节点：运行一个 agent 一次，把结果翻译成补丁与路由
//!
//! - 产出：校验 Schema，写入 deliverables，释放 active_agent；若本回合在完成一个委派，则弹出该请求并回到委派方
//! - 澄清：追加 human 请求并保持自己为 active_agent，驱动器随即中断
//! - 委派：追加 delegate 请求，跳到目标
//! - 保持：active_agent 仍是自己
//! - 失败：业务失败，路由器短路到结束

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::{validate_deliverable, AgentContext, AgentOutcome, AgentSpec};
use crate::core::{AgentError, ExecutionStatus, FailureKind, OrchestratorError};
use crate::events::EventType;
use crate::graph::{Node, NodeEnv, NodeOutcome};
use crate::memory::{Message, TimelineDraft};
use crate::state::{Blackboard, BlackboardRequest, RequestKind, RequestStatus, StatePatch};

/// 一次 agent 回合的结果
#[derive(Debug)]
pub struct TurnResult {
    pub outcome: AgentOutcome,
    /// agent 在回合中产生的副作用（压缩、待办、固定事实）
    pub patch: StatePatch,
    pub run_id: String,
    pub duration_ms: u64,
}

/// 该 agent 正在处理的委派请求
pub fn pending_delegate_for<'a>(board: &'a Blackboard, agent_id: &str) -> Option<&'a BlackboardRequest> {
    board.pending_requests.iter().find(|r| {
        r.kind == RequestKind::Delegate && r.is_pending() && r.target_agent.as_deref() == Some(agent_id)
    })
}

/// 本回合的任务：委派请求 > 分配给自己的任务
pub fn task_for(board: &Blackboard, agent_id: &str) -> Option<String> {
    if let Some(req) = pending_delegate_for(board, agent_id) {
        return req.payload.get("task").and_then(|t| t.as_str()).map(str::to_string);
    }
    if board.active_agent.as_deref() == Some(agent_id) {
        return board.assigned_task.clone();
    }
    None
}

/// 用户对本 agent 澄清请求的回答，以及消费后剩余的请求队列
fn take_human_responses(board: &Blackboard, agent_id: &str) -> (Vec<Value>, Option<Vec<BlackboardRequest>>) {
    let answered = |r: &BlackboardRequest| {
        r.kind == RequestKind::Human && r.status == RequestStatus::Completed && r.created_by == agent_id
    };
    if !board.pending_requests.iter().any(answered) {
        return (Vec::new(), None);
    }
    let responses = board
        .pending_requests
        .iter()
        .filter(|r| answered(r))
        .filter_map(|r| r.response.clone())
        .collect();
    let remaining = board
        .pending_requests
        .iter()
        .filter(|r| !answered(r))
        .cloned()
        .collect();
    (responses, Some(remaining))
}

/// 运行 agent 一次并校验输出契约；发出 agent.start，结束事件由调用方发出
pub async fn run_turn(
    env: &NodeEnv,
    spec: Arc<AgentSpec>,
    board: Blackboard,
    task: Option<String>,
    human_responses: Vec<Value>,
) -> Result<TurnResult, AgentError> {
    let entry = env
        .registry
        .get(&spec.id)
        .ok_or_else(|| AgentError::Business(format!("agent '{}' is not registered", spec.id)))?
        .clone();
    // 拓扑收窄白名单：ctx.delegate、能力提示与下方校验都看这份
    let declared = spec.clone();
    let spec = env.delegation.scope_spec(spec, &env.registry);
    let run_id = uuid::Uuid::new_v4().to_string();
    env.emitter.emit(
        env.emitter
            .event(EventType::AgentStart)
            .with_agent(spec.id.clone(), spec.name.clone())
            .with_span(run_id.clone(), Some(env.emitter.run_id().to_string()))
            .with_data(json!({ "task": task })),
    );
    tracing::info!(agent = %spec.id, task = ?task, "agent start");

    let start = Instant::now();
    let mut ctx = AgentContext::new(
        spec.clone(),
        env.services.clone(),
        env.registry.clone(),
        env.emitter.clone(),
        run_id.clone(),
        board,
        task,
        human_responses,
    );
    let outcome = entry.agent.run(&mut ctx).await?;

    match &outcome {
        AgentOutcome::Deliverable(value) => validate_deliverable(&spec, value)?,
        AgentOutcome::Delegate { target, .. } if !spec.can_delegate(target) || !env.registry.contains(target) => {
            let reason = if declared.can_delegate(target) {
                "topology does not allow this delegation"
            } else {
                "target not in can_delegate_to"
            };
            return Err(AgentError::DelegationRejected {
                from: spec.id.clone(),
                to: target.clone(),
                reason: reason.into(),
            });
        }
        _ => {}
    }

    Ok(TurnResult {
        outcome,
        patch: ctx.into_patch(),
        run_id,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// agent.end 事件
pub fn emit_agent_end(env: &NodeEnv, spec: &AgentSpec, run_id: &str, duration_ms: u64, data: Value) {
    env.emitter.emit(
        env.emitter
            .event(EventType::AgentEnd)
            .with_agent(spec.id.clone(), spec.name.clone())
            .with_span(run_id.to_string(), Some(env.emitter.run_id().to_string()))
            .with_duration(duration_ms)
            .with_data(data),
    );
}

pub struct AgentNode {
    agent_id: String,
    /// 计划模式：agent 错误记为系统失败交给控制器，而不是终止运行
    capture_errors: bool,
}

impl AgentNode {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capture_errors: false,
        }
    }

    pub fn capturing_errors(mut self) -> Self {
        self.capture_errors = true;
        self
    }

    fn result_message(&self, status: ExecutionStatus, version: Option<u32>) -> Message {
        let deliverable = version
            .map(|v| format!(" deliverable={}:v{v}", self.agent_id))
            .unwrap_or_default();
        Message::assistant(format!(
            "[RESULT] agent={} status={status}{deliverable}",
            self.agent_id
        ))
        .named(self.agent_id.clone())
    }

    /// 把回合结果翻译成补丁与路由
    fn translate(
        &self,
        env: &NodeEnv,
        board: &Blackboard,
        turn: TurnResult,
        requests: Option<Vec<BlackboardRequest>>,
    ) -> NodeOutcome {
        let id = &self.agent_id;
        let mut queue = requests.unwrap_or_else(|| board.pending_requests.clone());
        let mut patch = turn.patch;
        let end_draft = |content: String| {
            TimelineDraft::new(EventType::AgentEnd, content)
                .agent(id.clone())
                .duration(turn.duration_ms)
        };

        match turn.outcome {
            AgentOutcome::Deliverable(value) => {
                let version = board.deliverable_version(id) + 1;
                patch = patch
                    .deliverable(id.clone(), value.clone())
                    .status(ExecutionStatus::Completed)
                    .clear_failure()
                    .task(None)
                    .message(self.result_message(ExecutionStatus::Completed, Some(version)))
                    .record(end_draft(format!("completed, deliverable v{version}")));
                // 完成委派：弹出请求，回到委派方
                if let Some(pos) = queue.iter().position(|r| {
                    r.kind == RequestKind::Delegate && r.is_pending() && r.target_agent.as_deref() == Some(id)
                }) {
                    let mut req = queue.remove(pos);
                    req.complete(value);
                    let resume = req.resume_to.clone().unwrap_or_else(|| req.created_by.clone());
                    self.emit_delegation_end(env, board, &req, &resume);
                    patch = patch
                        .requests(queue)
                        .activate(resume.clone())
                        .record(TimelineDraft::new(EventType::DelegationEnd, format!("returned to {resume}")).agent(id.clone()));
                    return NodeOutcome::Goto(patch, resume);
                }
                NodeOutcome::Continue(patch.requests(queue).deactivate())
            }
            AgentOutcome::Clarify(payload) => {
                let question = payload
                    .get("question")
                    .and_then(|q| q.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string());
                queue.push(BlackboardRequest::human(id.clone(), payload));
                NodeOutcome::Continue(
                    patch
                        .requests(queue)
                        .activate(id.clone())
                        .status(ExecutionStatus::Running)
                        .message(Message::assistant(question).named(id.clone()))
                        .record(
                            TimelineDraft::new(EventType::AgentInterrupt, "waiting for user input")
                                .agent(id.clone())
                                .duration(turn.duration_ms),
                        ),
                )
            }
            AgentOutcome::Delegate { target, task } => {
                queue.push(BlackboardRequest::delegate(id.clone(), target.clone(), task.clone()));
                let patch = patch
                    .requests(queue)
                    .activate(target.clone())
                    .task(Some(task.clone()))
                    .status(ExecutionStatus::Running)
                    .message(
                        Message::assistant(format!("[DELEGATE] {id} -> {target}: {task}")).named(id.clone()),
                    )
                    .record(
                        TimelineDraft::new(EventType::DelegationStart, format!("{id} -> {target}"))
                            .agent(id.clone())
                            .metadata(json!({ "task": task })),
                    );
                NodeOutcome::Goto(patch, target)
            }
            AgentOutcome::Retain { note } => {
                let mut patch = patch.activate(id.clone()).status(ExecutionStatus::Running);
                if let Some(note) = note {
                    patch = patch.message(Message::assistant(note).named(id.clone()));
                }
                NodeOutcome::Continue(patch.requests(queue).record(end_draft("retained".into())))
            }
            AgentOutcome::Failed { reason } => {
                // 委派目标失败也是终态：请求出队
                if let Some(pos) = queue.iter().position(|r| {
                    r.kind == RequestKind::Delegate && r.is_pending() && r.target_agent.as_deref() == Some(id)
                }) {
                    queue.remove(pos);
                }
                NodeOutcome::Continue(
                    patch
                        .requests(queue)
                        .failure(FailureKind::Business, reason.clone())
                        .deactivate()
                        .message(self.result_message(ExecutionStatus::Failed, None))
                        .record(end_draft(format!("failed: {reason}"))),
                )
            }
        }
    }

    fn emit_delegation_end(&self, env: &NodeEnv, board: &Blackboard, req: &BlackboardRequest, resume: &str) {
        tracing::info!(
            session = %board.key,
            from = %self.agent_id,
            to = %resume,
            request = %req.request_id,
            "delegation completed"
        );
        env.emitter.emit(
            env.emitter
                .event(EventType::DelegationEnd)
                .with_agent(self.agent_id.clone(), self.agent_id.clone())
                .with_data(json!({
                    "request_id": req.request_id,
                    "from": req.created_by,
                    "to": self.agent_id,
                    "resume_to": resume,
                })),
        );
    }
}

#[async_trait]
impl Node for AgentNode {
    fn name(&self) -> &str {
        &self.agent_id
    }

    async fn execute(&self, board: &Blackboard, env: &NodeEnv) -> Result<NodeOutcome, OrchestratorError> {
        let spec = env
            .registry
            .spec(&self.agent_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownAgent(self.agent_id.clone()))?;
        let task = task_for(board, &self.agent_id);
        let (responses, remaining) = take_human_responses(board, &self.agent_id);

        let mut view = board.clone();
        if let Some(remaining) = &remaining {
            view.pending_requests = remaining.clone();
        }

        match run_turn(env, spec.clone(), view.clone(), task, responses).await {
            Ok(turn) => {
                let run_id = turn.run_id.clone();
                let duration = turn.duration_ms;
                let kind = turn.outcome.as_str();
                let outcome = self.translate(env, &view, turn, remaining);
                let status = outcome.patch().last_status.unwrap_or(ExecutionStatus::Completed);
                emit_agent_end(
                    env,
                    &spec,
                    &run_id,
                    duration,
                    json!({
                        "status": status,
                        "outcome": kind,
                        "deliverable_version": view.deliverable_version(&self.agent_id)
                            + u32::from(kind == "deliverable"),
                    }),
                );
                tracing::info!(agent = %self.agent_id, outcome = kind, duration_ms = duration, "agent end");
                Ok(outcome)
            }
            Err(e) if self.capture_errors => {
                tracing::warn!(agent = %self.agent_id, error = %e, "agent error captured");
                emit_agent_end(
                    env,
                    &spec,
                    &uuid::Uuid::new_v4().to_string(),
                    0,
                    json!({
                        "status": ExecutionStatus::Failed,
                        "error": { "error_type": e.error_type(), "message": e.to_string(), "retryable": e.retryable() },
                    }),
                );
                let mut patch = StatePatch::new()
                    .failure(e.failure_kind(), e.to_string())
                    .deactivate()
                    .message(self.result_message(ExecutionStatus::Failed, None))
                    .record(
                        TimelineDraft::new(EventType::AgentFailed, e.to_string())
                            .agent(self.agent_id.clone()),
                    );
                if let Some(remaining) = remaining {
                    patch = patch.requests(remaining);
                }
                Ok(NodeOutcome::Continue(patch))
            }
            Err(e) => Err(OrchestratorError::Agent(e.wrap(&self.agent_id))),
        }
    }
}
