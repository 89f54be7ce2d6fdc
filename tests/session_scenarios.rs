//! 会话生命周期场景：中断与恢复、中止、时间旅行、按需压缩、会话查询

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use hive::core::{ClassifiedError, ExecutionStatus};
use hive::llm::ScriptedLlmClient;
use hive::memory::compactor::SUMMARY_PREFIX;
use hive::memory::{CheckpointType, PinnedFact};
use hive::{
    Agent, AgentContext, AgentError, AgentOutcome, AgentSpec, EventType, FnAgent, OrchestratorBuilder,
    OrchestratorError, ProcessMode, TravelMode,
};

use common::{agent_starts, collect, config, count, last_event};

fn clarifying_team() -> OrchestratorBuilder {
    OrchestratorBuilder::new(config())
        .agent(
            AgentSpec::new("analyst", "Analyst"),
            FnAgent::new(|ctx| match ctx.human_responses().first() {
                Some(answer) => Ok(AgentOutcome::Deliverable(json!({ "region": answer.clone() }))),
                None => Ok(AgentOutcome::Clarify(json!({ "question": "Which region?" }))),
            }),
        )
        .agent(
            AgentSpec::new("developer", "Developer"),
            FnAgent::new(|ctx| {
                Ok(AgentOutcome::Deliverable(json!({
                    "region": ctx.deliverable("analyst").map(|d| d["region"].clone()),
                })))
            }),
        )
}

#[tokio::test]
async fn test_interrupt_then_resume_at_requesting_agent() {
    let orch = clarifying_team().build().unwrap();

    let (events, err) = collect(orch.stream("deploy the service", "hitl")).await;
    assert!(err.is_none());
    assert_eq!(agent_starts(&events), ["analyst"]);
    let interrupt = events.last().unwrap();
    assert_eq!(interrupt.event, EventType::AgentInterrupt);
    let data = interrupt.data.as_ref().unwrap();
    assert_eq!(data["state"], "waiting");
    assert_eq!(data["payload"]["question"], "Which region?");

    let waiting = orch.load_session("hitl").await.unwrap();
    assert!(waiting.has_pending_human());
    assert_eq!(waiting.active_agent.as_deref(), Some("analyst"));
    assert_eq!(
        waiting.timeline.latest_checkpoint().unwrap().checkpoint_type,
        Some(CheckpointType::Auto)
    );

    let (events, err) = collect(orch.resume("hitl", json!("eu-west-1")).await.unwrap()).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(agent_starts(&events), ["analyst", "developer"]);
    let start = events.iter().find(|e| e.event == EventType::SessionStart).unwrap();
    assert_eq!(start.data.as_ref().unwrap()["resumed"], true);
    assert_eq!(last_event(&events), EventType::SessionEnd);

    let board = orch.load_session("hitl").await.unwrap();
    assert_eq!(board.deliverable("developer").unwrap()["region"], "eu-west-1");
    assert!(!board.has_pending_human());
    assert!(board.pending_requests.is_empty());
}

#[tokio::test]
async fn test_stream_while_waiting_answers_the_request() {
    let orch = clarifying_team().build().unwrap();
    let _ = collect(orch.stream("deploy", "hitl-chat")).await;

    let (events, err) = collect(orch.stream("us-east-1", "hitl-chat")).await;
    assert!(err.is_none());
    assert_eq!(agent_starts(&events), ["analyst", "developer"]);
    let board = orch.load_session("hitl-chat").await.unwrap();
    assert_eq!(board.deliverable("analyst").unwrap()["region"], "us-east-1");
    assert_eq!(board.goal.as_deref(), Some("deploy"));
}

#[tokio::test]
async fn test_resume_requires_a_pending_request() {
    let orch = clarifying_team().build().unwrap();
    assert!(matches!(
        orch.resume("nobody", json!("x")).await,
        Err(OrchestratorError::SessionNotFound(_))
    ));

    let _ = collect(orch.stream("deploy", "answered")).await;
    let _ = collect(orch.resume("answered", json!("eu")).await.unwrap()).await;
    assert!(matches!(
        orch.resume("answered", json!("again")).await,
        Err(OrchestratorError::NoPendingRequest(_))
    ));
}

/// 第一次运行时阻塞，直到测试放行
struct Gate {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Agent for Gate {
    async fn run(&self, _ctx: &mut AgentContext) -> Result<AgentOutcome, AgentError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(AgentOutcome::Deliverable(json!({ "slow": true })))
    }
}

#[tokio::test]
async fn test_abort_stops_at_next_node_boundary() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let orch = OrchestratorBuilder::new(config())
        .agent(
            AgentSpec::new("slow", "Slow"),
            Gate {
                started: started.clone(),
                release: release.clone(),
            },
        )
        .agent(
            AgentSpec::new("after", "After"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({})))),
        )
        .build()
        .unwrap();

    let stream = orch.stream("long job", "abort");
    started.notified().await;
    assert!(orch.is_running("abort"));
    assert!(orch.abort("abort"));
    release.notify_one();

    let (events, err) = collect(stream).await;
    assert!(err.is_none());
    assert_eq!(agent_starts(&events), ["slow"]);
    assert_eq!(last_event(&events), EventType::SessionAborted);

    let board = orch.load_session("abort").await.unwrap();
    assert_eq!(board.last_status, Some(ExecutionStatus::Aborted));
    assert!(board.active_agent.is_none());
    assert!(!orch.is_running("abort"));
    assert!(!orch.abort("abort"));
}

#[tokio::test]
async fn test_abort_discards_parallel_layer() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::Parallel)
        .agent(
            AgentSpec::new("fast", "Fast"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "rows": 1 })))),
        )
        .agent(
            AgentSpec::new("slow", "Slow"),
            Gate {
                started: started.clone(),
                release: release.clone(),
            },
        )
        .agent(
            AgentSpec::new("merge", "Merge").depends_on(["fast", "slow"]),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "merged": true })))),
        )
        .build()
        .unwrap();

    let stream = orch.stream("fan out", "abort-par");
    started.notified().await;
    assert!(orch.abort("abort-par"));
    release.notify_one();

    let (events, err) = collect(stream).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    let starts = agent_starts(&events);
    assert!(starts.iter().any(|a| a == "slow"));
    assert!(!starts.iter().any(|a| a == "merge"), "next layer ran after abort: {starts:?}");
    assert_eq!(last_event(&events), EventType::SessionAborted);
    assert_eq!(count(&events, EventType::SessionAborted), 1);

    // 层内已完成的兄弟任务结果也一并丢弃
    let board = orch.load_session("abort-par").await.unwrap();
    assert!(board.deliverables.is_empty(), "{:?}", board.deliverables);
    assert_eq!(board.last_status, Some(ExecutionStatus::Aborted));
    assert!(board.active_agent.is_none());
}

fn pipeline() -> OrchestratorBuilder {
    OrchestratorBuilder::new(config())
        .agent(
            AgentSpec::new("analyst", "Analyst"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "step": 1 })))),
        )
        .agent(
            AgentSpec::new("developer", "Developer"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "step": 2 })))),
        )
        .agent(
            AgentSpec::new("reviewer", "Reviewer"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "step": 3 })))),
        )
}

#[tokio::test]
async fn test_time_travel_branch_then_rewind() {
    let orch = pipeline().build().unwrap();
    let (_, err) = collect(orch.stream("ship it", "tt")).await;
    assert!(err.is_none());

    let checkpoints = orch.list_checkpoints("tt").await.unwrap();
    assert_eq!(checkpoints[0].checkpoint_type, Some(CheckpointType::UserMessage));
    let target = checkpoints
        .iter()
        .find(|c| c.agent_id.as_deref() == Some("analyst"))
        .unwrap()
        .clone();
    assert_eq!(target.checkpoint_type, Some(CheckpointType::AgentEnd));

    let before = orch.session_stats("tt").await.unwrap();
    let branched = orch
        .time_travel("tt", &target.checkpoint_id, TravelMode::Branch)
        .await
        .unwrap();
    assert!(branched.success);
    assert_ne!(branched.session_id, "tt");
    assert_eq!(orch.session_stats("tt").await.unwrap().timeline_entries, before.timeline_entries);

    let branch = orch.load_session(&branched.session_id).await.unwrap();
    assert!(branch.timeline.entries().iter().all(|e| e.seq <= target.seq));
    assert_eq!(branch.deliverables.len(), 1);

    let rewound = orch
        .time_travel("tt", &target.checkpoint_id, TravelMode::Rewind)
        .await
        .unwrap();
    assert_eq!(rewound.session_id, "tt");
    assert!(rewound.removed_entries > 0);
    let board = orch.load_session("tt").await.unwrap();
    assert!(board.timeline.entries().iter().all(|e| e.seq <= target.seq));
    assert_eq!(board.timeline.current_checkpoint_id(), Some(target.checkpoint_id.as_str()));
    assert!(board.deliverable("developer").is_none());

    // 回到过去后可以继续对话
    let (events, err) = collect(orch.stream("ship it again", "tt")).await;
    assert!(err.is_none());
    assert_eq!(agent_starts(&events), ["analyst", "developer", "reviewer"]);

    assert!(matches!(
        orch.time_travel("tt", "cp_missing", TravelMode::Rewind).await,
        Err(OrchestratorError::CheckpointNotFound { .. })
    ));
}

#[tokio::test]
async fn test_session_queries_and_cleanup() {
    let orch = pipeline().build().unwrap();
    let (_, err) = collect(orch.stream("ship it", "q")).await;
    assert!(err.is_none());

    let stats = orch.session_stats("q").await.unwrap();
    assert_eq!(stats.deliverable_count, 3);
    assert_eq!(stats.last_status, Some(ExecutionStatus::Completed));
    assert_eq!(stats.iteration_count, 3);
    assert!(stats.active_agent.is_none());
    // user message + 每个 agent 一个 [RESULT]
    assert_eq!(stats.message_count, 4);
    assert_eq!(stats.checkpoints, 4);

    let manual = orch.create_checkpoint("q", "before release").await.unwrap();
    let listed = orch.list_checkpoints("q").await.unwrap();
    let last = listed.last().unwrap();
    assert_eq!(last.checkpoint_id, manual);
    assert_eq!(last.checkpoint_type, Some(CheckpointType::Manual));

    assert!(orch.clear_session("q").await.unwrap());
    assert!(matches!(
        orch.session_stats("q").await,
        Err(OrchestratorError::SessionNotFound(_))
    ));
    assert!(!orch.clear_session("q").await.unwrap());
}

#[tokio::test]
async fn test_iteration_guard_stops_self_loop() {
    let mut cfg = config();
    cfg.runtime.max_iterations = 3;
    let orch = OrchestratorBuilder::new(cfg)
        .agent(
            AgentSpec::new("looper", "Looper"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Retain { note: None })),
        )
        .build()
        .unwrap();
    let (events, err) = collect(orch.stream("spin", "loop")).await;
    assert!(err.is_none());
    assert_eq!(agent_starts(&events).len(), 3);
    let end = events.last().unwrap();
    assert_eq!(end.event, EventType::SessionEnd);
    assert_eq!(end.data.as_ref().unwrap()["reason"], "max_iterations");
}

/// 每回合固定一条事实并调用一次 LLM
struct Chatty;

#[async_trait]
impl Agent for Chatty {
    async fn run(&self, ctx: &mut AgentContext) -> Result<AgentOutcome, AgentError> {
        ctx.pin(PinnedFact::decision("warehouse is postgres"));
        let reply = ctx.chat().await?;
        Ok(AgentOutcome::Deliverable(json!({ "reply": reply.content })))
    }
}

#[tokio::test]
async fn test_compaction_only_after_context_overflow() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .reply("first answer")
            .fail(ClassifiedError::context_exceeded("context_length_exceeded"))
            .reply("user asked about the warehouse twice")
            .reply("second answer"),
    );
    let mut cfg = config();
    cfg.context.compact_keep_recent = 1;
    let orch = OrchestratorBuilder::new(cfg)
        .llm(llm.clone())
        .agent(AgentSpec::new("assistant", "Assistant"), Chatty)
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("describe the warehouse", "compact")).await;
    assert!(err.is_none());
    assert_eq!(count(&events, EventType::MemoryCompact), 0);
    assert_eq!(llm.call_count(), 1);

    let (events, err) = collect(orch.stream("and the indexes?", "compact")).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(count(&events, EventType::MemoryCompact), 1);
    let overflow = events
        .iter()
        .position(|e| {
            e.event == EventType::LlmEnd
                && e.data.as_ref().is_some_and(|d| d["error"]["category"] == "context")
        })
        .unwrap();
    let compact = events.iter().position(|e| e.event == EventType::MemoryCompact).unwrap();
    assert!(overflow < compact);
    // 溢出调用、摘要调用、重试调用
    assert_eq!(llm.call_count(), 4);

    let retried = llm.calls().pop().unwrap();
    assert!(retried.messages.iter().any(|m| m.content.contains("warehouse is postgres")));
    assert!(retried.messages.iter().any(|m| m.content.starts_with(SUMMARY_PREFIX)));

    let board = orch.load_session("compact").await.unwrap();
    assert_eq!(board.pinned.len(), 1);
    assert!(board.messages[0].content.starts_with(SUMMARY_PREFIX));
    assert_eq!(board.deliverable("assistant").unwrap()["reply"], "second answer");
}

#[tokio::test]
async fn test_token_usage_accumulates_across_turns() {
    let orch = OrchestratorBuilder::new(config())
        .agent(AgentSpec::new("assistant", "Assistant"), Chatty)
        .agent(AgentSpec::new("reviewer", "Reviewer"), Chatty)
        .build()
        .unwrap();

    let (_, err) = collect(orch.stream("how big is the orders table", "usage")).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    let first = orch.session_stats("usage").await.unwrap().usage;
    assert_eq!(first.llm_calls, 2);
    assert!(first.total.prompt_tokens > 0);
    assert!(first.total.completion_tokens > 0);
    assert_eq!(
        first.total.total_tokens,
        first.agent("assistant").total_tokens + first.agent("reviewer").total_tokens
    );

    let (_, err) = collect(orch.stream("and the customers table", "usage")).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    let second = orch.session_stats("usage").await.unwrap().usage;
    assert_eq!(second.llm_calls, 4);
    assert!(second.total.total_tokens > first.total.total_tokens);
    assert!(second.agent("reviewer").prompt_tokens > first.agent("reviewer").prompt_tokens);
}

#[tokio::test]
async fn test_explicit_compaction_persists_summary() {
    let mut cfg = config();
    cfg.context.compact_keep_recent = 2;
    let orch = pipeline().config(cfg).build().unwrap();
    let (_, err) = collect(orch.stream("ship it", "manual")).await;
    assert!(err.is_none());

    let mut bus = orch.subscribe_session("manual");
    let result = orch.compact_session("manual").await.unwrap();
    assert_eq!(result.removed, 2);
    let event = bus.recv().await.unwrap();
    assert_eq!(event.event, EventType::MemoryCompact);

    let board = orch.load_session("manual").await.unwrap();
    assert_eq!(board.messages.len(), 3);
    assert!(board.messages[0].content.starts_with(SUMMARY_PREFIX));
    assert_eq!(
        board.timeline.entries().last().unwrap().event_type,
        EventType::MemoryCompact
    );
}
