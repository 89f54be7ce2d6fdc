//! 编排器：会话级 API
//!
//! `stream` 为每次运行启动一个后台任务：加载或创建黑板 → 编译（缓存的）执行图 → 图驱动器推进，
//! 事件经 EventEmitter 同时推送给调用方与事件总线。中断后用 `resume` 继续；`abort` 在节点边界生效。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::agent::{AgentRegistry, AgentServices};
use crate::checkpoint::{travel, history_prefix, CheckpointStore, TimeTravelResult, TravelMode};
use crate::core::{ExecutionStatus, OrchestratorError, SessionSupervisor, TaskScheduler};
use crate::events::{EventBus, EventEmitter, EventReceiver, EventType, SessionEventReceiver, StreamEvent};
use crate::graph::{build_graph, ExecutionGraph, NodeEnv, NodeSettings, ProcessMode};
use crate::memory::{CheckpointType, CompactResult, CompactTrigger, Message, TimelineDraft};
use crate::runtime::driver::{failure_event, persist_head, save_checkpoint, GraphDriver, RunEnd};
use crate::state::{Blackboard, RequestKind, SessionKey, SessionTodo, SessionUsage, StatePatch};

/// stream / resume 返回的事件流；终止错误作为最后一项 `Err` 出现
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, OrchestratorError>> + Send>>;

/// 会话概览
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub version: u64,
    pub message_count: usize,
    pub deliverable_count: usize,
    pub active_agent: Option<String>,
    pub last_status: Option<ExecutionStatus>,
    pub iteration_count: u32,
    pub timeline_entries: usize,
    pub checkpoints: usize,
    pub pinned_facts: usize,
    pub todo_items: usize,
    /// 会话累计 token 用量（按 agent 拆分）
    pub usage: SessionUsage,
}

/// 可回到的检查点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: String,
    pub checkpoint_type: Option<CheckpointType>,
    pub seq: u64,
    pub agent_id: Option<String>,
    pub content: String,
    pub timestamp_ms: i64,
}

enum RunStart {
    Goal(String),
    Resume(Value),
}

pub(crate) struct OrchestratorInner {
    pub(crate) namespace: String,
    pub(crate) mode: ProcessMode,
    pub(crate) max_iterations: u32,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) services: Arc<AgentServices>,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) bus: EventBus,
    pub(crate) supervisor: SessionSupervisor,
    pub(crate) scheduler: Arc<TaskScheduler>,
    pub(crate) settings: NodeSettings,
    /// (拓扑, 注册表指纹) -> 编译好的图
    pub(crate) graphs: Mutex<HashMap<(ProcessMode, String), Arc<ExecutionGraph>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub(crate) fn from_inner(inner: OrchestratorInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn key(&self, session_id: &str) -> SessionKey {
        SessionKey::new(self.inner.namespace.clone(), session_id)
    }

    pub fn mode(&self) -> ProcessMode {
        self.inner.mode
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.bus.subscribe()
    }

    pub fn subscribe_session(&self, session_id: &str) -> SessionEventReceiver {
        self.inner.bus.subscribe_session(&self.key(session_id))
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.inner.supervisor.is_running(&self.key(session_id).thread_id())
    }

    /// 编译（或取缓存的）执行图
    pub fn graph(&self, mode: ProcessMode) -> Result<Arc<ExecutionGraph>, OrchestratorError> {
        self.inner.graph(mode)
    }

    pub fn cached_graphs(&self) -> usize {
        self.inner.graphs.lock().len()
    }

    /// 以默认拓扑运行一轮
    pub fn stream(&self, goal: impl Into<String>, session_id: &str) -> EventStream {
        self.stream_with(goal, session_id, self.inner.mode)
    }

    /// 以指定拓扑运行一轮；会话有待回答的澄清请求时，goal 作为回答
    pub fn stream_with(&self, goal: impl Into<String>, session_id: &str, mode: ProcessMode) -> EventStream {
        self.spawn_run(self.key(session_id), mode, RunStart::Goal(goal.into()))
    }

    /// 回答第一个待处理的 human 请求，并从其 resume_to 继续
    pub async fn resume(&self, session_id: &str, response: Value) -> Result<EventStream, OrchestratorError> {
        let key = self.key(session_id);
        let board = self.load_session(session_id).await?;
        if !board.has_pending_human() {
            return Err(OrchestratorError::NoPendingRequest(key.to_string()));
        }
        Ok(self.spawn_run(key, self.inner.mode, RunStart::Resume(response)))
    }

    /// 请求中止；会话不在运行时返回 false
    pub fn abort(&self, session_id: &str) -> bool {
        let key = self.key(session_id);
        let aborted = self.inner.supervisor.abort(&key.thread_id());
        tracing::info!(session = %key, aborted, "abort requested");
        aborted
    }

    fn spawn_run(&self, key: SessionKey, mode: ProcessMode, start: RunStart) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let emitter = EventEmitter::new(key.clone(), inner.bus.clone(), Some(tx));
            let thread = key.thread_id();
            let Some(token) = inner.supervisor.begin(&thread) else {
                let err = OrchestratorError::SessionBusy(key.to_string());
                emitter.emit(failure_event(&emitter, &err, None));
                emitter.fail(err);
                return;
            };
            let result = inner.run(&key, mode, start, &emitter, token).await;
            inner.supervisor.finish(&thread);
            match result {
                Ok(RunEnd::Failed(err)) => emitter.fail(err),
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(session = %key, error = %err, "run setup failed");
                    emitter.emit(failure_event(&emitter, &err, None));
                    emitter.fail(err);
                }
            }
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Blackboard, OrchestratorError> {
        let key = self.key(session_id);
        self.inner
            .store
            .load(&key.thread_id())
            .await?
            .map(|cp| cp.state)
            .ok_or_else(|| OrchestratorError::SessionNotFound(key.to_string()))
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats, OrchestratorError> {
        let board = self.load_session(session_id).await?;
        Ok(SessionStats {
            session_id: board.key.session_id.clone(),
            version: board.version,
            message_count: board.messages.len(),
            deliverable_count: board.deliverables.len(),
            active_agent: board.active_agent.clone(),
            last_status: board.last_status,
            iteration_count: board.iteration_count,
            timeline_entries: board.timeline.len(),
            checkpoints: board.timeline.checkpoint_ids().len(),
            pinned_facts: board.pinned.len(),
            todo_items: board.todo.items().len(),
            usage: board.usage,
        })
    }

    pub async fn session_todo(&self, session_id: &str) -> Result<SessionTodo, OrchestratorError> {
        Ok(self.load_session(session_id).await?.todo)
    }

    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointInfo>, OrchestratorError> {
        let board = self.load_session(session_id).await?;
        Ok(board
            .timeline
            .entries()
            .iter()
            .filter(|e| e.is_checkpoint)
            .filter_map(|e| {
                Some(CheckpointInfo {
                    checkpoint_id: e.checkpoint_id.clone()?,
                    checkpoint_type: e.checkpoint_type,
                    seq: e.seq,
                    agent_id: e.agent_id.clone(),
                    content: e.content.clone(),
                    timestamp_ms: e.timestamp_ms,
                })
            })
            .collect())
    }

    /// 删除会话头与全部历史检查点；会话不存在时返回 false
    pub async fn clear_session(&self, session_id: &str) -> Result<bool, OrchestratorError> {
        let key = self.key(session_id);
        self.ensure_idle(&key)?;
        let store = &self.inner.store;
        let existed = store.delete(&key.thread_id()).await?;
        let mut removed = 0;
        for thread in store.list(&history_prefix(&key)).await? {
            if store.delete(&thread).await? {
                removed += 1;
            }
        }
        tracing::info!(session = %key, existed, checkpoints = removed, "session cleared");
        Ok(existed)
    }

    /// 手动检查点
    pub async fn create_checkpoint(&self, session_id: &str, label: &str) -> Result<String, OrchestratorError> {
        let key = self.key(session_id);
        self.ensure_idle(&key)?;
        let mut board = self.load_session(session_id).await?;
        let emitter = EventEmitter::detached(key, self.inner.bus.clone());
        let id = save_checkpoint(
            self.inner.store.as_ref(),
            &emitter,
            &mut board,
            CheckpointType::Manual,
            None,
            label,
        )
        .await?;
        Ok(id)
    }

    /// 回到检查点（Rewind）或从检查点分叉（Branch）
    pub async fn time_travel(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        mode: TravelMode,
    ) -> Result<TimeTravelResult, OrchestratorError> {
        let key = self.key(session_id);
        self.ensure_idle(&key)?;
        let (result, _restored) = travel(self.inner.store.as_ref(), &key, checkpoint_id, mode).await?;
        let target = key.with_session(result.session_id.clone());
        let emitter = EventEmitter::detached(target, self.inner.bus.clone());
        emitter.emit(
            emitter
                .event(EventType::CheckpointRestore)
                .with_data(json!({ "mode": mode, "result": result, "from_session": key.session_id })),
        );
        Ok(result)
    }

    /// 显式压缩会话历史
    pub async fn compact_session(&self, session_id: &str) -> Result<CompactResult, OrchestratorError> {
        let key = self.key(session_id);
        self.ensure_idle(&key)?;
        let mut board = self.load_session(session_id).await?;
        let result = self
            .inner
            .services
            .compactor
            .compact(&board.messages, CompactTrigger::ExplicitRequest)
            .await;
        if result.is_noop() {
            return Ok(result);
        }
        board.apply(
            StatePatch::new()
                .replace_messages(result.messages.clone())
                .record(
                    TimelineDraft::new(EventType::MemoryCompact, format!("compacted {} messages", result.removed))
                        .metadata(json!({ "trigger": result.trigger })),
                ),
        );
        persist_head(self.inner.store.as_ref(), &board).await?;
        let emitter = EventEmitter::detached(key.clone(), self.inner.bus.clone());
        emitter.emit(emitter.event(EventType::MemoryCompact).with_data(json!({
            "trigger": result.trigger,
            "removed": result.removed,
            "remaining": result.messages.len(),
        })));
        tracing::info!(session = %key, removed = result.removed, "session compacted");
        Ok(result)
    }

    fn ensure_idle(&self, key: &SessionKey) -> Result<(), OrchestratorError> {
        if self.inner.supervisor.is_running(&key.thread_id()) {
            return Err(OrchestratorError::SessionBusy(key.to_string()));
        }
        Ok(())
    }
}

impl OrchestratorInner {
    fn graph(&self, mode: ProcessMode) -> Result<Arc<ExecutionGraph>, OrchestratorError> {
        let cache_key = (mode, self.registry.fingerprint());
        if let Some(graph) = self.graphs.lock().get(&cache_key) {
            return Ok(graph.clone());
        }
        let graph = Arc::new(build_graph(mode, &self.registry)?);
        tracing::info!(%mode, nodes = graph.node_names().len(), "graph compiled");
        self.graphs.lock().insert(cache_key, graph.clone());
        Ok(graph)
    }

    async fn run(
        &self,
        key: &SessionKey,
        mode: ProcessMode,
        start: RunStart,
        emitter: &EventEmitter,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<RunEnd, OrchestratorError> {
        let graph = self.graph(mode)?;
        let mut board = match self.store.load(&key.thread_id()).await? {
            Some(checkpoint) => checkpoint.state,
            None => Blackboard::new(key.clone(), self.max_iterations),
        };

        let (start_node, goal, resumed) = match start {
            RunStart::Goal(goal) if board.has_pending_human() => {
                let resume_to = answer_pending(&mut board, Value::String(goal.clone()))?;
                (resume_node(&graph, &board, &resume_to), goal, true)
            }
            RunStart::Goal(goal) => {
                begin_turn(&mut board, &goal);
                save_checkpoint(
                    self.store.as_ref(),
                    emitter,
                    &mut board,
                    CheckpointType::UserMessage,
                    None,
                    "user message",
                )
                .await?;
                (graph.entry().to_string(), goal, false)
            }
            RunStart::Resume(response) => {
                let resume_to = answer_pending(&mut board, response)?;
                let goal = board.goal.clone().unwrap_or_default();
                (resume_node(&graph, &board, &resume_to), goal, true)
            }
        };

        tracing::info!(session = %key, %mode, start = %start_node, resumed, "session start");
        emitter.emit(
            emitter
                .event(EventType::SessionStart)
                .with_span(emitter.run_id().to_string(), None)
                .with_data(json!({ "goal": goal, "mode": mode, "resumed": resumed, "start": start_node })),
        );
        board.apply(StatePatch::new().record(TimelineDraft::new(
            EventType::SessionStart,
            if resumed { "resumed" } else { "started" },
        )));

        let env = NodeEnv {
            registry: self.registry.clone(),
            services: self.services.clone(),
            emitter: emitter.clone(),
            cancel,
            scheduler: self.scheduler.clone(),
            settings: self.settings,
            delegation: graph.delegation().clone(),
        };
        let end = GraphDriver::new(&graph, &env, self.store.as_ref())
            .run(&mut board, start_node)
            .await;

        if matches!(end, RunEnd::Completed | RunEnd::IterationLimit) {
            let reason = match end {
                RunEnd::IterationLimit => "max_iterations",
                _ => "completed",
            };
            let status = board.last_status.unwrap_or(ExecutionStatus::Completed);
            board.apply(
                StatePatch::new().record(TimelineDraft::new(EventType::SessionEnd, format!("{status} ({reason})"))),
            );
            persist_head(self.store.as_ref(), &board).await?;
            tracing::info!(session = %key, %status, iterations = board.iteration_count, reason, "session end");
            emitter.emit(
                emitter
                    .event(EventType::SessionEnd)
                    .with_span(emitter.run_id().to_string(), None)
                    .with_data(json!({
                        "status": status,
                        "reason": reason,
                        "iterations": board.iteration_count,
                        "deliverables": board.deliverables.keys().collect::<Vec<_>>(),
                    })),
            );
        }
        Ok(end)
    }
}

/// 新一轮对话：保留历史与产出，追加用户消息
fn begin_turn(board: &mut Blackboard, goal: &str) {
    board.reset_for_new_turn(goal);
    board.apply(
        StatePatch::new()
            .goal(goal)
            .message(Message::user(goal))
            .status(ExecutionStatus::Running)
            .record(TimelineDraft::new(EventType::UserMessage, goal)),
    );
}

/// 填写第一个待处理的 human 请求，返回应恢复的 agent
fn answer_pending(board: &mut Blackboard, response: Value) -> Result<String, OrchestratorError> {
    let mut queue = board.pending_requests.clone();
    let request = queue
        .iter_mut()
        .find(|r| r.kind == RequestKind::Human && r.is_pending())
        .ok_or_else(|| OrchestratorError::NoPendingRequest(board.key.to_string()))?;
    request.complete(response.clone());
    let resume_to = request
        .resume_to
        .clone()
        .unwrap_or_else(|| request.created_by.clone());
    let text = match response {
        Value::String(s) => s,
        other => other.to_string(),
    };
    board.apply(
        StatePatch::new()
            .requests(queue)
            .activate(resume_to.clone())
            .status(ExecutionStatus::Running)
            .clear_failure()
            .message(Message::user(text.clone()))
            .record(TimelineDraft::new(EventType::UserMessage, text).agent(resume_to.clone())),
    );
    Ok(resume_to)
}

fn resume_node(graph: &ExecutionGraph, board: &Blackboard, resume_to: &str) -> String {
    if graph.contains(resume_to) {
        resume_to.to_string()
    } else {
        graph.resume_node(board)
    }
}
