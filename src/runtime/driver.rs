//! 图驱动器：逐节点推进一次会话运行
//!
//! 每步：检查中止令牌与迭代上限 → 执行节点 → 合并补丁 → 保存检查点 → 检查中断 → 路由。
//! 检查点条目由驱动器直接写入时间线，其余状态变化都经过 StatePatch。

use serde_json::json;

use crate::checkpoint::{Checkpoint, CheckpointStore, StoreError};
use crate::core::{AgentError, ExecutionStatus, FailureKind, OrchestratorError};
use crate::events::{EventEmitter, EventType, StreamEvent};
use crate::graph::{ExecutionGraph, NodeEnv, END};
use crate::memory::{CheckpointType, TimelineDraft};
use crate::state::{cancel_pending_delegates, first_pending_human, Blackboard, StatePatch};

/// 一次运行如何结束
#[derive(Debug)]
pub enum RunEnd {
    Completed,
    /// 等待用户输入
    Interrupted,
    Aborted,
    /// 达到 max_iterations，平稳停止
    IterationLimit,
    Failed(OrchestratorError),
}

/// 写入检查点条目，保存历史快照与会话头，发出 checkpoint.create
pub async fn save_checkpoint(
    store: &dyn CheckpointStore,
    emitter: &EventEmitter,
    board: &mut Blackboard,
    checkpoint_type: CheckpointType,
    agent_id: Option<String>,
    content: &str,
) -> Result<String, StoreError> {
    let checkpoint_id = format!("cp_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
    board
        .timeline
        .add_checkpoint(checkpoint_id.clone(), checkpoint_type, agent_id.clone(), content);
    let checkpoint = Checkpoint::new(checkpoint_id.clone(), checkpoint_type, board.clone());
    store
        .save(&board.key.checkpoint_thread(&checkpoint_id), &checkpoint)
        .await?;
    store.save(&board.key.thread_id(), &checkpoint).await?;
    tracing::debug!(session = %board.key, checkpoint = %checkpoint_id, ?checkpoint_type, "checkpoint saved");

    let mut event = emitter.event(EventType::CheckpointCreate).with_data(json!({
        "checkpoint_id": checkpoint_id,
        "checkpoint_type": checkpoint_type,
        "version": board.version,
    }));
    if let Some(agent) = agent_id {
        event = event.with_agent(agent.clone(), agent);
    }
    emitter.emit(event);
    Ok(checkpoint_id)
}

/// 只覆盖会话头（不新增检查点）
pub async fn persist_head(store: &dyn CheckpointStore, board: &Blackboard) -> Result<(), StoreError> {
    let checkpoint_id = board
        .timeline
        .current_checkpoint_id()
        .unwrap_or("head")
        .to_string();
    store
        .save(
            &board.key.thread_id(),
            &Checkpoint::new(checkpoint_id, CheckpointType::Auto, board.clone()),
        )
        .await
}

pub struct GraphDriver<'a> {
    graph: &'a ExecutionGraph,
    env: &'a NodeEnv,
    store: &'a dyn CheckpointStore,
}

impl<'a> GraphDriver<'a> {
    pub fn new(graph: &'a ExecutionGraph, env: &'a NodeEnv, store: &'a dyn CheckpointStore) -> Self {
        Self { graph, env, store }
    }

    /// 从 start 节点开始推进，直到结束、中断、中止、失败或迭代上限
    pub async fn run(&self, board: &mut Blackboard, start: String) -> RunEnd {
        let mut current = start;
        let mut last_node: Option<String> = None;

        loop {
            if self.env.cancel.is_cancelled() {
                return self.abort(board).await;
            }
            if current == END {
                return self.complete(board, last_node.as_deref()).await;
            }
            if board.iterations_exhausted() {
                tracing::warn!(
                    session = %board.key,
                    iterations = board.iteration_count,
                    node = %current,
                    "max iterations reached, stopping"
                );
                board.apply(StatePatch::new().deactivate().record(TimelineDraft::new(
                    EventType::SessionEnd,
                    format!("stopped after {} iterations", board.iteration_count),
                )));
                if let Err(e) = persist_head(self.store, board).await {
                    return self.fail(board, e.into(), last_node.as_deref()).await;
                }
                return RunEnd::IterationLimit;
            }
            let Some(node) = self.graph.node(&current) else {
                let err = OrchestratorError::Config(format!("graph has no node '{current}'"));
                return self.fail(board, err, last_node.as_deref()).await;
            };

            board.iteration_count += 1;
            tracing::debug!(session = %board.key, node = %current, iteration = board.iteration_count, "node start");
            let outcome = match node.execute(board, self.env).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let agent = agent_of(&e).unwrap_or(current.clone());
                    return self.fail(board, e, Some(&agent)).await;
                }
            };

            let (patch, route) = outcome.split();
            let wrote_deliverable = !patch.deliverables.is_empty();
            board.apply(patch);
            last_node = Some(current.clone());

            if self.env.cancel.is_cancelled() {
                return self.abort(board).await;
            }

            let agent = self.env.registry.contains(&current).then(|| current.clone());
            let checkpoint_type = if wrote_deliverable {
                CheckpointType::AgentEnd
            } else {
                CheckpointType::Auto
            };
            if let Err(e) = save_checkpoint(
                self.store,
                &self.env.emitter,
                board,
                checkpoint_type,
                agent,
                &format!("after {current}"),
            )
            .await
            {
                return self.fail(board, e.into(), Some(&current)).await;
            }

            if let Some(request) = first_pending_human(&board.pending_requests) {
                tracing::info!(
                    session = %board.key,
                    agent = %request.created_by,
                    request = %request.request_id,
                    "interrupted, waiting for user input"
                );
                self.env.emitter.emit(
                    self.env
                        .emitter
                        .event(EventType::AgentInterrupt)
                        .with_agent(request.created_by.clone(), request.created_by.clone())
                        .with_data(json!({
                            "state": "waiting",
                            "request_id": request.request_id,
                            "payload": request.payload,
                        })),
                );
                return RunEnd::Interrupted;
            }

            let next = self.graph.next(&current, &route, board);
            tracing::debug!(session = %board.key, from = %current, to = %next, "route");
            current = next;
        }
    }

    async fn complete(&self, board: &mut Blackboard, last_node: Option<&str>) -> RunEnd {
        if board.last_status == Some(ExecutionStatus::Failed) {
            let reason = board.error.clone().unwrap_or_else(|| "task failed".into());
            let error = match board.last_failure_kind {
                Some(FailureKind::System) => AgentError::System(reason),
                _ => AgentError::Business(reason),
            };
            let error = match last_node {
                Some(agent) => error.wrap(agent),
                None => error,
            };
            return self.fail(board, OrchestratorError::Agent(error), last_node).await;
        }
        if let Err(e) = persist_head(self.store, board).await {
            return self.fail(board, e.into(), last_node).await;
        }
        RunEnd::Completed
    }

    async fn abort(&self, board: &mut Blackboard) -> RunEnd {
        tracing::info!(session = %board.key, "run aborted");
        let cleanup = drop_delegations(board);
        board.apply(
            cleanup
                .status(ExecutionStatus::Aborted)
                .deactivate()
                .record(TimelineDraft::new(EventType::SessionAborted, "aborted by request")),
        );
        if let Err(e) = save_checkpoint(self.store, &self.env.emitter, board, CheckpointType::Auto, None, "aborted").await {
            tracing::error!(session = %board.key, error = %e, "failed to persist aborted session");
        }
        self.env.emitter.emit(
            self.env
                .emitter
                .event(EventType::SessionAborted)
                .with_data(json!({ "status": ExecutionStatus::Aborted, "iterations": board.iteration_count })),
        );
        RunEnd::Aborted
    }

    /// 终止性失败：记录、保存 error_recovery 检查点、发出 agent.failed
    async fn fail(&self, board: &mut Blackboard, err: OrchestratorError, agent: Option<&str>) -> RunEnd {
        let kind = match &err {
            OrchestratorError::Agent(e) => e.failure_kind(),
            _ => FailureKind::System,
        };
        tracing::error!(session = %board.key, agent = ?agent, error = %err, "run failed");

        let mut draft = TimelineDraft::new(EventType::AgentFailed, err.to_string());
        if let Some(agent) = agent {
            draft = draft.agent(agent);
        }
        let cleanup = drop_delegations(board);
        board.apply(
            cleanup
                .failure(kind, err.to_string())
                .deactivate()
                .record(draft),
        );
        if let Err(e) = save_checkpoint(
            self.store,
            &self.env.emitter,
            board,
            CheckpointType::ErrorRecovery,
            agent.map(str::to_string),
            "before failure",
        )
        .await
        {
            tracing::error!(session = %board.key, error = %e, "failed to save error_recovery checkpoint");
        }

        let name = agent.map(|a| {
            self.env
                .registry
                .spec(a)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| a.to_string())
        });
        let event = failure_event(&self.env.emitter, &err, agent.zip(name));
        self.env.emitter.emit(event);
        RunEnd::Failed(err)
    }
}

/// agent.failed 事件：`data.error = {error_type, message, retryable, detail}`
pub fn failure_event(emitter: &EventEmitter, err: &OrchestratorError, agent: Option<(&str, String)>) -> StreamEvent {
    let detail = match err {
        OrchestratorError::Agent(e) => e.detail(),
        _ => String::new(),
    };
    let event = emitter.event(EventType::AgentFailed).with_data(json!({
        "error": {
            "error_type": err.error_type(),
            "message": err.to_string(),
            "retryable": err.retryable(),
            "detail": detail,
        }
    }));
    match agent {
        Some((id, name)) => event.with_agent(id.to_string(), name),
        None => event,
    }
}

/// 运行结束时取消未完成的委派，返回写回队列的补丁
fn drop_delegations(board: &Blackboard) -> StatePatch {
    let (kept, canceled) = cancel_pending_delegates(&board.pending_requests);
    if canceled.is_empty() {
        return StatePatch::new();
    }
    for req in &canceled {
        tracing::debug!(
            session = %board.key,
            request = %req.request_id,
            from = %req.created_by,
            to = ?req.target_agent,
            status = ?req.status,
            "delegation canceled"
        );
    }
    StatePatch::new().requests(kept)
}

fn agent_of(err: &OrchestratorError) -> Option<String> {
    match err {
        OrchestratorError::Agent(e) => e.agent_id().map(str::to_string),
        _ => None,
    }
}

