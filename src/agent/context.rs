//! Agent 上下文：交给 agent 的 LLM / 工具 / 委派接口
//!
//! 每个节点执行创建一个 AgentContext，持有黑板快照（只读）与本回合的局部轮次；
//! agent 的副作用（压缩后的历史、待办、固定事实、时间线）累积在内部补丁中，
//! 由节点在回合结束时合并进黑板。

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::agent::{AgentOutcome, AgentRegistry, AgentSpec};
use crate::core::{AgentError, ErrorCategory};
use crate::events::{EventEmitter, EventType, StreamEvent};
use crate::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::memory::{
    AssemblyInput, CompactTrigger, Compactor, ContextAssembler, Message, PinnedFact, TimelineDraft,
};
use crate::state::{Blackboard, SessionTodo, StatePatch};
use crate::tools::{reply_protocol_prompt, ToolExecutor};

/// 运行时注入给所有 agent 的共享服务
pub struct AgentServices {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolExecutor>,
    pub compactor: Arc<Compactor>,
    pub assembler: ContextAssembler,
}

pub struct AgentContext {
    spec: Arc<AgentSpec>,
    services: Arc<AgentServices>,
    registry: Arc<AgentRegistry>,
    emitter: EventEmitter,
    run_id: String,
    board: Blackboard,
    task: Option<String>,
    human_responses: Vec<Value>,
    turns: Vec<Message>,
    patch: StatePatch,
    todo_dirty: bool,
    compacted: bool,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: Arc<AgentSpec>,
        services: Arc<AgentServices>,
        registry: Arc<AgentRegistry>,
        emitter: EventEmitter,
        run_id: impl Into<String>,
        board: Blackboard,
        task: Option<String>,
        human_responses: Vec<Value>,
    ) -> Self {
        Self {
            spec,
            services,
            registry,
            emitter,
            run_id: run_id.into(),
            board,
            task,
            human_responses,
            turns: Vec::new(),
            patch: StatePatch::new(),
            todo_dirty: false,
            compacted: false,
        }
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn agent_id(&self) -> &str {
        &self.spec.id
    }

    pub fn goal(&self) -> Option<&str> {
        self.board.goal.as_deref()
    }

    /// 委派方或计划分配的任务；没有时为 None
    pub fn task(&self) -> Option<&str> {
        self.task.as_deref()
    }

    pub fn board(&self) -> &Blackboard {
        &self.board
    }

    pub fn deliverable(&self, agent_id: &str) -> Option<&Value> {
        self.board.deliverable(agent_id)
    }

    /// 用户对本 agent 澄清请求的回答（按提问顺序）
    pub fn human_responses(&self) -> &[Value] {
        &self.human_responses
    }

    pub fn turns(&self) -> &[Message] {
        &self.turns
    }

    pub fn push_turn(&mut self, message: Message) {
        self.turns.push(message);
    }

    /// 组装后的完整上下文 + 本回合局部轮次
    pub fn messages(&self) -> Vec<Message> {
        let mut capabilities = String::new();
        let tool_schema = self.services.tools.registry().schema_for(&self.spec.tools);
        if !tool_schema.is_empty() {
            capabilities.push_str("## Tools\n");
            capabilities.push_str(
                &serde_json::to_string_pretty(&tool_schema).unwrap_or_default(),
            );
            capabilities.push('\n');
        }
        if !self.spec.can_delegate_to.is_empty() {
            capabilities.push_str("## Delegation targets\n");
            for id in &self.spec.can_delegate_to {
                let desc = self
                    .registry
                    .spec(id)
                    .map(|s| s.description.clone())
                    .unwrap_or_default();
                capabilities.push_str(&format!("- {id}: {desc}\n"));
            }
        }
        capabilities.push_str(&reply_protocol_prompt(
            !tool_schema.is_empty(),
            !self.spec.can_delegate_to.is_empty(),
        ));

        let knowledge = if self.spec.knowledge_domains.is_empty() {
            None
        } else {
            Some(format!(
                "## Knowledge domains\n{}",
                self.spec.knowledge_domains.join(", ")
            ))
        };
        let input = AssemblyInput {
            agent_id: &self.spec.id,
            instructions: &self.spec.instructions,
            capabilities,
            knowledge,
            upstream: &self.spec.depends_on,
            task: self.task.as_deref(),
        };
        let mut messages = self.services.assembler.assemble(&input, &self.board);
        for response in &self.human_responses {
            messages.push(Message::user(format!("[clarification] {response}")));
        }
        messages.extend(self.turns.iter().cloned());
        messages
    }

    /// 调用 LLM。上下文超限时压缩历史并重试一次；其余错误原样返回。
    pub async fn chat(&mut self) -> Result<LlmResponse, AgentError> {
        match self.complete_once().await {
            Err(AgentError::Llm(e)) if e.category == ErrorCategory::Context && !self.compacted => {
                tracing::warn!(agent = %self.spec.id, error = %e, "context overflow, compacting");
                self.compact_history().await;
                self.complete_once().await
            }
            other => other,
        }
    }

    async fn complete_once(&mut self) -> Result<LlmResponse, AgentError> {
        let request = LlmRequest::new(self.messages()).with_temperature(self.spec.temperature);
        self.emit(
            self.event(EventType::LlmStart)
                .with_data(json!({ "model": self.services.llm.model_name(), "messages": request.messages.len() })),
        );
        let start = Instant::now();
        let result = self.services.llm.complete(&request).await;
        let elapsed = start.elapsed().as_millis() as u64;
        match result {
            Ok(resp) => {
                self.emit(
                    self.event(EventType::LlmEnd)
                        .with_duration(elapsed)
                        .with_data(json!({ "usage": resp.usage })),
                );
                self.patch.usage.record(&self.spec.id, resp.usage);
                Ok(resp)
            }
            Err(e) => {
                self.emit(
                    self.event(EventType::LlmEnd)
                        .with_duration(elapsed)
                        .with_data(json!({ "error": { "category": e.category.as_str(), "message": e.message } })),
                );
                Err(AgentError::Llm(e))
            }
        }
    }

    async fn compact_history(&mut self) {
        self.compacted = true;
        let result = self
            .services
            .compactor
            .compact(&self.board.messages, CompactTrigger::ContextOverflow)
            .await;
        self.emit(self.event(EventType::MemoryCompact).with_data(json!({
            "trigger": result.trigger,
            "removed": result.removed,
            "kept": result.messages.len(),
        })));
        self.patch.timeline.push(
            TimelineDraft::new(
                EventType::MemoryCompact,
                format!("compacted {} messages", result.removed),
            )
            .agent(self.spec.id.clone()),
        );
        self.board.messages = result.messages.clone();
        self.patch.replace_messages = Some(result.messages);
    }

    /// 以本 agent 身份调用工具；结果作为 tool 轮次追加到局部上下文
    pub async fn call_tool(&mut self, tool: &str, args: Value) -> Result<String, AgentError> {
        self.emit(
            self.event(EventType::ToolCall)
                .with_data(json!({ "tool": tool, "args": args.clone() })),
        );
        let start = Instant::now();
        let result = self
            .services
            .tools
            .execute(&self.spec.id, &self.spec.tools, tool, args)
            .await;
        let elapsed = start.elapsed().as_millis() as u64;
        match &result {
            Ok(output) => {
                self.emit(
                    self.event(EventType::ToolResult)
                        .with_duration(elapsed)
                        .with_data(json!({ "tool": tool, "output": preview(output) })),
                );
                self.turns.push(Message::tool(tool, output.clone()));
            }
            Err(e) => {
                self.emit(
                    self.event(EventType::ToolError)
                        .with_duration(elapsed)
                        .with_data(json!({ "tool": tool, "error": e.to_string(), "error_type": e.error_type() })),
                );
            }
        }
        result
    }

    /// 委派给另一个 agent；目标必须在 can_delegate_to 中且已注册
    pub fn delegate(
        &self,
        target: impl Into<String>,
        task: impl Into<String>,
    ) -> Result<AgentOutcome, AgentError> {
        let target = target.into();
        let reason = if target == self.spec.id {
            Some("cannot delegate to itself")
        } else if !self.spec.can_delegate(&target) {
            Some("target not in can_delegate_to")
        } else if !self.registry.contains(&target) {
            Some("unknown agent")
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::warn!(from = %self.spec.id, to = %target, reason, "delegation rejected");
            return Err(AgentError::DelegationRejected {
                from: self.spec.id.clone(),
                to: target,
                reason: reason.to_string(),
            });
        }
        let task = task.into();
        self.emit(
            self.event(EventType::DelegationStart)
                .with_data(json!({ "from": self.spec.id, "to": target, "task": task })),
        );
        Ok(AgentOutcome::Delegate { target, task })
    }

    pub fn todo(&self) -> &SessionTodo {
        &self.board.todo
    }

    /// 修改待办；回合结束时整体写回
    pub fn todo_mut(&mut self) -> &mut SessionTodo {
        self.todo_dirty = true;
        &mut self.board.todo
    }

    pub fn pin(&mut self, fact: PinnedFact) {
        self.patch.pinned.push(fact.by(self.spec.id.clone()));
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    fn event(&self, event_type: EventType) -> StreamEvent {
        self.emitter
            .event(event_type)
            .with_agent(self.spec.id.clone(), self.spec.name.clone())
            .with_span(self.run_id.clone(), Some(self.emitter.run_id().to_string()))
    }

    fn emit(&self, event: StreamEvent) {
        self.emitter.emit(event);
    }

    /// 回合副作用
    pub(crate) fn into_patch(self) -> StatePatch {
        let mut patch = self.patch;
        if self.todo_dirty {
            self.emitter.emit(
                self.emitter
                    .event(EventType::TodoUpdate)
                    .with_agent(self.spec.id.clone(), self.spec.name.clone())
                    .with_data(json!({ "todo": self.board.todo })),
            );
            patch.todo = Some(self.board.todo);
        }
        patch
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 500 {
        format!("{}...", text.chars().take(500).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::events::EventBus;
    use crate::memory::CompactPolicy;
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
    use crate::state::SessionKey;
    use crate::tools::{EchoTool, ToolRegistry};

    pub fn services(llm: Arc<dyn LlmClient>) -> Arc<AgentServices> {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        Arc::new(AgentServices {
            llm,
            tools: Arc::new(ToolExecutor::new(
                tools,
                5,
                RetryPolicy::none(),
                Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            )),
            compactor: Arc::new(Compactor::new(CompactPolicy {
                keep_recent: 2,
                ..CompactPolicy::default()
            })),
            assembler: ContextAssembler::default(),
        })
    }

    pub fn context(
        spec: AgentSpec,
        llm: Arc<dyn LlmClient>,
        registry: AgentRegistry,
        board: Blackboard,
    ) -> (AgentContext, EventBus) {
        let bus = EventBus::new(64);
        let emitter = EventEmitter::detached(SessionKey::new("test", "s1"), bus.clone());
        let task = board.assigned_task.clone();
        let ctx = AgentContext::new(
            Arc::new(spec),
            services(llm),
            Arc::new(registry),
            emitter,
            "run-1",
            board,
            task,
            Vec::new(),
        );
        (ctx, bus)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::context;
    use super::*;
    use crate::agent::FnAgent;
    use crate::core::ClassifiedError;
    use crate::llm::ScriptedLlmClient;
    use crate::state::SessionKey;

    fn registry() -> AgentRegistry {
        let mut reg = AgentRegistry::new();
        for id in ["a", "b", "c"] {
            reg.register(
                AgentSpec::new(id, id.to_uppercase()),
                FnAgent::new(|_| Ok(AgentOutcome::Retain { note: None })),
            )
            .unwrap();
        }
        reg
    }

    fn board_with_history(n: usize) -> Blackboard {
        let mut bb = Blackboard::new(SessionKey::new("test", "s1"), 10);
        bb.goal = Some("goal".into());
        bb.messages.push(Message::system("decision: keep schema v2").pin());
        for i in 0..n {
            bb.messages.push(Message::user(format!("turn {i}")));
        }
        bb
    }

    #[tokio::test]
    async fn test_delegation_outside_allow_list_rejected() {
        let spec = AgentSpec::new("a", "A").delegates_to(["c"]);
        let (ctx, _bus) = context(spec, Arc::new(ScriptedLlmClient::new()), registry(), board_with_history(0));
        let err = ctx.delegate("b", "do it").unwrap_err();
        assert!(matches!(err, AgentError::DelegationRejected { ref to, .. } if to == "b"));
        assert_eq!(
            ctx.delegate("c", "do it").unwrap(),
            AgentOutcome::Delegate { target: "c".into(), task: "do it".into() }
        );
    }

    #[tokio::test]
    async fn test_no_compaction_without_context_error() {
        let llm = Arc::new(ScriptedLlmClient::new().reply("ok"));
        let (mut ctx, _bus) = context(AgentSpec::new("a", "A"), llm.clone(), registry(), board_with_history(10));
        ctx.chat().await.unwrap();
        assert_eq!(llm.call_count(), 1);
        assert!(ctx.into_patch().replace_messages.is_none());
    }

    #[tokio::test]
    async fn test_context_error_compacts_then_retries_once() {
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .fail(ClassifiedError::context_exceeded("context_length_exceeded"))
                .reply("fits now"),
        );
        let (mut ctx, bus) = context(AgentSpec::new("a", "A"), llm.clone(), registry(), board_with_history(10));
        let mut events = bus.subscribe();
        let resp = ctx.chat().await.unwrap();
        assert_eq!(resp.content, "fits now");
        assert_eq!(llm.call_count(), 2);

        // 重试请求里的历史已被压缩，固定消息仍在
        let retried = &llm.calls()[1].messages;
        assert!(retried.iter().any(|m| m.pinned && m.content.contains("schema v2")));
        assert!(!retried.iter().any(|m| m.content == "turn 0"));

        let patch = ctx.into_patch();
        let compacted = patch.replace_messages.unwrap();
        assert!(compacted[0].pinned);
        assert_eq!(compacted.len(), 1 + 1 + 2);

        let mut saw_compact = false;
        while let Ok(ev) = events.try_recv() {
            saw_compact |= ev.event == EventType::MemoryCompact;
        }
        assert!(saw_compact);
    }

    #[tokio::test]
    async fn test_second_context_error_surfaces() {
        let llm = Arc::new(
            ScriptedLlmClient::new()
                .fail(ClassifiedError::context_exceeded("too long"))
                .fail(ClassifiedError::context_exceeded("still too long")),
        );
        let (mut ctx, _bus) = context(AgentSpec::new("a", "A"), llm.clone(), registry(), board_with_history(10));
        let err = ctx.chat().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Context);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_tool_allow_list_enforced() {
        let spec = AgentSpec::new("a", "A").tools(["echo"]);
        let (mut ctx, _bus) = context(spec, Arc::new(ScriptedLlmClient::new()), registry(), board_with_history(0));
        let out = ctx.call_tool("echo", serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
        assert_eq!(ctx.turns().len(), 1);

        let spec = AgentSpec::new("b", "B");
        let (mut ctx, _bus) = context(spec, Arc::new(ScriptedLlmClient::new()), registry(), board_with_history(0));
        let err = ctx.call_tool("echo", serde_json::json!({"text": "hi"})).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_todo_changes_flow_into_patch() {
        let (mut ctx, _bus) = context(AgentSpec::new("a", "A"), Arc::new(ScriptedLlmClient::new()), registry(), board_with_history(0));
        ctx.todo_mut().add("collect metrics");
        ctx.pin(PinnedFact::decision("ship on friday"));
        let patch = ctx.into_patch();
        assert_eq!(patch.todo.unwrap().items().len(), 1);
        assert_eq!(patch.pinned[0].agent_id.as_deref(), Some("a"));
    }
}
