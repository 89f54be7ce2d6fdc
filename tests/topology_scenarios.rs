//! 协作拓扑场景：顺序、动态委派、分层并行、map-reduce、计划-执行-反思

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use hive::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use hive::llm::ScriptedLlmClient;
use hive::state::RequestKind;
use hive::{AgentError, AgentOutcome, AgentSpec, EventType, FnAgent, OrchestratorBuilder, OrchestratorError, ProcessMode};

use common::{agent_starts, collect, config, last_event};

#[tokio::test]
async fn test_sequential_self_loop_then_advance() {
    let analyst_runs = Arc::new(AtomicUsize::new(0));
    let runs = analyst_runs.clone();
    let orch = OrchestratorBuilder::new(config())
        .agent(
            AgentSpec::new("analyst", "Analyst"),
            FnAgent::new(move |_ctx| {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(AgentOutcome::Retain {
                        note: Some("one more pass over the schema".into()),
                    })
                } else {
                    Ok(AgentOutcome::Deliverable(json!({ "tables": 3 })))
                }
            }),
        )
        .agent(
            AgentSpec::new("developer", "Developer"),
            FnAgent::new(|ctx| {
                Ok(AgentOutcome::Deliverable(json!({
                    "saw_analysis": ctx.deliverable("analyst").is_some(),
                })))
            }),
        )
        .agent(
            AgentSpec::new("reviewer", "Reviewer"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "approved": true })))),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("design the warehouse", "seq")).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(agent_starts(&events), ["analyst", "analyst", "developer", "reviewer"]);
    assert_eq!(last_event(&events), EventType::SessionEnd);

    let board = orch.load_session("seq").await.unwrap();
    assert_eq!(board.deliverable("developer").unwrap()["saw_analysis"], true);
    assert_eq!(board.deliverable_version("analyst"), 1);
    assert!(board.active_agent.is_none());
    assert_eq!(board.iteration_count, 4);
}

#[tokio::test]
async fn test_failure_short_circuits_sequential_chain() {
    let orch = OrchestratorBuilder::new(config())
        .agent(
            AgentSpec::new("analyst", "Analyst"),
            FnAgent::new(|_ctx| {
                Ok(AgentOutcome::Failed {
                    reason: "source tables missing".into(),
                })
            }),
        )
        .agent(
            AgentSpec::new("developer", "Developer"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({})))),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("design", "fail")).await;
    assert_eq!(agent_starts(&events), ["analyst"]);
    assert_eq!(last_event(&events), EventType::AgentFailed);
    let failed = events.last().unwrap();
    assert_eq!(failed.data.as_ref().unwrap()["error"]["error_type"], "business");
    assert_eq!(failed.data.as_ref().unwrap()["error"]["retryable"], false);
    match err {
        Some(OrchestratorError::Agent(e)) => {
            assert_eq!(e.agent_id(), Some("analyst"));
            assert_eq!(e.error_type(), "business");
        }
        other => panic!("expected agent error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delegation_outside_allow_list_is_rejected() {
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::Dynamic)
        .agent(
            AgentSpec::new("a", "A"),
            FnAgent::new(|ctx| ctx.delegate("b", "count the rows")),
        )
        .agent(
            AgentSpec::new("b", "B"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "rows": 10 })))),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("count", "reject")).await;
    assert_eq!(agent_starts(&events), ["a"]);
    assert_eq!(count_delegations(&events), 0);
    assert_eq!(last_event(&events), EventType::AgentFailed);
    match err {
        Some(OrchestratorError::Agent(e)) => assert_eq!(e.error_type(), "delegation_rejected"),
        other => panic!("expected delegation rejection, got {other:?}"),
    }
    let board = orch.load_session("reject").await.unwrap();
    assert!(board.deliverable("b").is_none());
    assert!(board.pending_requests.is_empty());
}

fn count_delegations(events: &[hive::StreamEvent]) -> usize {
    common::count(events, EventType::DelegationStart)
}

#[tokio::test]
async fn test_dynamic_delegation_returns_to_delegator() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::Dynamic)
        .store(store.clone())
        .agent(
            AgentSpec::new("manager", "Manager").delegates_to(["worker"]),
            FnAgent::new(|ctx| match ctx.deliverable("worker") {
                Some(rows) => Ok(AgentOutcome::Deliverable(json!({ "summary": rows.clone() }))),
                None => ctx.delegate("worker", "count the rows"),
            }),
        )
        .agent(
            AgentSpec::new("worker", "Worker"),
            FnAgent::new(|ctx| {
                Ok(AgentOutcome::Deliverable(json!({
                    "rows": 42,
                    "task": ctx.task(),
                })))
            }),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("summarize", "dyn")).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(agent_starts(&events), ["manager", "worker", "manager"]);
    assert_eq!(common::count(&events, EventType::DelegationEnd), 1);

    let board = orch.load_session("dyn").await.unwrap();
    assert_eq!(board.deliverable("worker").unwrap()["task"], "count the rows");
    assert_eq!(board.deliverable("manager").unwrap()["summary"]["rows"], 42);
    assert!(board.pending_requests.iter().all(|r| !r.is_pending()));

    // 每个快照里最多一个 active_agent，且委派进行中时它就是被委派方
    let history = store.list("default:dyn@").await.unwrap();
    assert!(!history.is_empty());
    for thread in history {
        let snapshot = store.load(&thread).await.unwrap().unwrap().state;
        if let Some(active) = &snapshot.active_agent {
            assert!(active == "manager" || active == "worker");
        }
        if let Some(req) = snapshot
            .pending_requests
            .iter()
            .find(|r| r.kind == RequestKind::Delegate && r.is_pending())
        {
            assert_eq!(snapshot.active_agent.as_deref(), req.target_agent.as_deref());
        }
    }
}

#[tokio::test]
async fn test_hierarchical_subordinates_return_to_manager() {
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::Hierarchical)
        .agent(
            AgentSpec::new("lead", "Lead").delegates_to(["sql", "docs"]),
            FnAgent::new(|ctx| {
                if ctx.deliverable("sql").is_none() {
                    ctx.delegate("sql", "write the query")
                } else if ctx.deliverable("docs").is_none() {
                    ctx.delegate("docs", "document the query")
                } else {
                    Ok(AgentOutcome::Deliverable(json!({ "done": true })))
                }
            }),
        )
        .agent(
            AgentSpec::new("sql", "SQL"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "query": "select 1" })))),
        )
        .agent(
            AgentSpec::new("docs", "Docs"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "doc": "returns one" })))),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("ship the report", "tree")).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(agent_starts(&events), ["lead", "sql", "lead", "docs", "lead"]);
}

#[tokio::test]
async fn test_hierarchical_subordinate_cannot_delegate() {
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::Hierarchical)
        .agent(
            AgentSpec::new("lead", "Lead"),
            FnAgent::new(|ctx| match ctx.deliverable("sql") {
                Some(_) => Ok(AgentOutcome::Deliverable(json!({ "done": true }))),
                None => ctx.delegate("sql", "write the query"),
            }),
        )
        .agent(
            AgentSpec::new("sql", "SQL").delegates_to(["docs"]),
            FnAgent::new(|ctx| ctx.delegate("docs", "document the query")),
        )
        .agent(
            AgentSpec::new("docs", "Docs"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "doc": "returns one" })))),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("ship the report", "tree-deny")).await;
    // 管理者白名单为空时可以委派给任一下属；下属自己的白名单被拓扑收回
    assert_eq!(agent_starts(&events), ["lead", "sql"]);
    assert_eq!(count_delegations(&events), 1);
    assert_eq!(last_event(&events), EventType::AgentFailed);
    match err {
        Some(OrchestratorError::Agent(e)) => {
            assert_eq!(e.error_type(), "delegation_rejected");
            assert_eq!(e.agent_id(), Some("sql"));
        }
        other => panic!("expected delegation rejection, got {other:?}"),
    }
    let board = orch.load_session("tree-deny").await.unwrap();
    assert!(board.deliverable("docs").is_none());
    assert!(board.pending_requests.is_empty());
}

#[tokio::test]
async fn test_sequential_mode_rejects_delegation() {
    let orch = OrchestratorBuilder::new(config())
        .agent(
            AgentSpec::new("analyst", "Analyst").delegates_to(["reviewer"]),
            FnAgent::new(|ctx| ctx.delegate("reviewer", "check my numbers")),
        )
        .agent(
            AgentSpec::new("developer", "Developer"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({})))),
        )
        .agent(
            AgentSpec::new("reviewer", "Reviewer"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "approved": true })))),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("design", "seq-deny")).await;
    assert_eq!(agent_starts(&events), ["analyst"]);
    assert_eq!(count_delegations(&events), 0);
    match err {
        Some(OrchestratorError::Agent(e)) => assert_eq!(e.error_type(), "delegation_rejected"),
        other => panic!("expected delegation rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_delegation_does_not_leak_into_next_turn() {
    let a_runs = Arc::new(AtomicUsize::new(0));
    let tasks: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let runs = a_runs.clone();
    let seen = tasks.clone();
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::Dynamic)
        .agent(
            AgentSpec::new("a", "A").delegates_to(["b"]),
            FnAgent::new(move |ctx| {
                if let Some(out) = ctx.deliverable("b") {
                    return Ok(AgentOutcome::Deliverable(json!({ "from_b": out.clone() })));
                }
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    ctx.delegate("b", "old subtask")
                } else {
                    ctx.delegate("b", "new subtask")
                }
            }),
        )
        .agent(
            AgentSpec::new("b", "B"),
            FnAgent::new(move |ctx| {
                let mut tasks = seen.lock().unwrap();
                tasks.push(ctx.task().map(str::to_string));
                if tasks.len() == 1 {
                    Err(AgentError::Business("warehouse offline".into()))
                } else {
                    Ok(AgentOutcome::Deliverable(json!({ "task": ctx.task() })))
                }
            }),
        )
        .build()
        .unwrap();

    let (_, err) = collect(orch.stream("first try", "leak")).await;
    assert!(matches!(err, Some(OrchestratorError::Agent(_))), "{err:?}");
    let board = orch.load_session("leak").await.unwrap();
    assert!(
        board.pending_requests.iter().all(|r| !r.is_pending()),
        "failed run left {:?}",
        board.pending_requests
    );

    let (events, err) = collect(orch.stream("second try", "leak")).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(agent_starts(&events), ["a", "b", "a"]);
    assert_eq!(
        *tasks.lock().unwrap(),
        [Some("old subtask".to_string()), Some("new subtask".to_string())]
    );
    let board = orch.load_session("leak").await.unwrap();
    assert_eq!(board.deliverable("b").unwrap()["task"], "new subtask");
    assert!(board.pending_requests.iter().all(|r| !r.is_pending()));
}

/// 随机 DAG：任何 agent 开始时，它依赖的 agent 都已留下产出
#[tokio::test]
async fn test_parallel_respects_dependencies_on_random_dags() {
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = rng.gen_range(2..8);
        let violated = Arc::new(AtomicBool::new(false));
        let finished: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut deps_of: HashMap<String, Vec<String>> = HashMap::new();

        let mut builder = OrchestratorBuilder::new(config()).mode(ProcessMode::Parallel);
        for i in 0..n {
            let id = format!("n{i}");
            let deps: Vec<String> = (0..i).filter(|_| rng.gen_bool(0.4)).map(|j| format!("n{j}")).collect();
            deps_of.insert(id.clone(), deps.clone());
            let violated = violated.clone();
            let finished = finished.clone();
            let me = id.clone();
            builder = builder.agent(
                AgentSpec::new(id.clone(), id.clone()).depends_on(deps.clone()),
                FnAgent::new(move |ctx| {
                    if deps.iter().any(|d| ctx.deliverable(d).is_none()) {
                        violated.store(true, Ordering::SeqCst);
                    }
                    finished.lock().unwrap().push(me.clone());
                    Ok(AgentOutcome::Deliverable(json!({ "agent": me })))
                }),
            );
        }
        let orch = builder.build().unwrap();

        let (events, err) = collect(orch.stream("run the dag", &format!("dag-{seed}"))).await;
        assert!(err.is_none(), "seed {seed}: {err:?}");
        assert!(!violated.load(Ordering::SeqCst), "seed {seed}: dependency started early");
        assert_eq!(agent_starts(&events).len(), n);

        let order = finished.lock().unwrap().clone();
        let position = |id: &str| order.iter().position(|o| o == id).unwrap();
        for (id, deps) in &deps_of {
            for dep in deps {
                assert!(position(dep) < position(id), "seed {seed}: {dep} must finish before {id}");
            }
        }
        let board = orch.load_session(&format!("dag-{seed}")).await.unwrap();
        assert_eq!(board.deliverables.len(), n);
    }
}

#[tokio::test]
async fn test_dependency_cycle_fails_before_any_node_runs() {
    let ran = Arc::new(AtomicBool::new(false));
    let agent = |ran: Arc<AtomicBool>| {
        FnAgent::new(move |_ctx| {
            ran.store(true, Ordering::SeqCst);
            Ok(AgentOutcome::Deliverable(json!({})))
        })
    };

    let built = OrchestratorBuilder::new(config())
        .mode(ProcessMode::Parallel)
        .agent(AgentSpec::new("a", "A").depends_on(["c"]), agent(ran.clone()))
        .agent(AgentSpec::new("b", "B").depends_on(["a"]), agent(ran.clone()))
        .agent(AgentSpec::new("c", "C").depends_on(["b"]), agent(ran.clone()))
        .build();
    match built {
        Err(OrchestratorError::CyclicDependency(ids)) => assert_eq!(ids, ["a", "b", "c"]),
        Err(other) => panic!("expected cycle error, got {other}"),
        Ok(_) => panic!("expected cycle error"),
    }

    // 顺序拓扑不看 depends_on，但切换到并行运行时同样在任何节点之前失败
    let orch = OrchestratorBuilder::new(config())
        .agent(AgentSpec::new("a", "A").depends_on(["b"]), agent(ran.clone()))
        .agent(AgentSpec::new("b", "B").depends_on(["a"]), agent(ran.clone()))
        .build()
        .unwrap();
    let (events, err) = collect(orch.stream_with("go", "cyc", ProcessMode::Parallel)).await;
    assert!(matches!(err, Some(OrchestratorError::CyclicDependency(_))));
    assert!(agent_starts(&events).is_empty());
    assert_eq!(last_event(&events), EventType::AgentFailed);
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_map_reduce_isolates_task_failure() {
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::MapReduce)
        .agent(
            AgentSpec::new("extract", "Extract"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "rows": 100 })))),
        )
        .agent(
            AgentSpec::new("transform", "Transform"),
            FnAgent::new(|_ctx| {
                Ok(AgentOutcome::Failed {
                    reason: "unparseable dates".into(),
                })
            }),
        )
        .agent(
            AgentSpec::new("audit", "Audit"),
            FnAgent::new(|_ctx| Err(AgentError::System("audit backend unreachable".into()))),
        )
        .agent(
            AgentSpec::new("load", "Load"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Deliverable(json!({ "loaded": true })))),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("nightly etl", "mr")).await;
    assert!(err.is_none(), "one failed task must not fail the run: {err:?}");
    let mut started = agent_starts(&events);
    started.sort();
    assert_eq!(started, ["audit", "extract", "load", "transform"]);
    assert_eq!(last_event(&events), EventType::SessionEnd);

    let board = orch.load_session("mr").await.unwrap();
    let reduced = board.deliverable("reducer").unwrap();
    assert_eq!(reduced["completed"], 2);
    assert_eq!(reduced["failed"], 2);
    let tasks = reduced["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 4);
    let by_agent = |agent: &str| tasks.iter().find(|t| t["agent"] == agent).unwrap().clone();
    assert_eq!(by_agent("transform")["status"], "failed");
    assert_eq!(by_agent("transform")["failure_kind"], "business");
    assert_eq!(by_agent("audit")["failure_kind"], "system");
    assert_eq!(by_agent("load")["output"]["loaded"], true);
}

#[tokio::test]
async fn test_map_reduce_fails_when_every_task_fails() {
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::MapReduce)
        .agent(
            AgentSpec::new("only", "Only"),
            FnAgent::new(|_ctx| Ok(AgentOutcome::Failed { reason: "no input".into() })),
        )
        .build()
        .unwrap();
    let (events, err) = collect(orch.stream("etl", "mr-all")).await;
    assert!(matches!(err, Some(OrchestratorError::Agent(_))));
    assert_eq!(last_event(&events), EventType::AgentFailed);
}

#[tokio::test]
async fn test_react_reflects_and_retries_business_failure() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .reply(r#"{"tasks":[{"agent":"research","description":"collect sources"},{"agent":"write","description":"draft the report"}]}"#)
            .reply(r#"{"decision":"retry","reason":"draft was empty"}"#)
            .reply(r#"{"decision":"end","reason":"report complete"}"#),
    );
    let drafts = Arc::new(AtomicUsize::new(0));
    let attempts = drafts.clone();
    let orch = OrchestratorBuilder::new(config())
        .mode(ProcessMode::React)
        .llm(llm.clone())
        .agent(
            AgentSpec::new("research", "Research"),
            FnAgent::new(|ctx| Ok(AgentOutcome::Deliverable(json!({ "task": ctx.task() })))),
        )
        .agent(
            AgentSpec::new("write", "Write"),
            FnAgent::new(move |_ctx| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(AgentOutcome::Failed { reason: "empty draft".into() })
                } else {
                    Ok(AgentOutcome::Deliverable(json!({ "words": 800 })))
                }
            }),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("write a market report", "react")).await;
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(agent_starts(&events), ["research", "write", "write"]);
    assert_eq!(llm.call_count(), 3);

    let board = orch.load_session("react").await.unwrap();
    let summary = board.deliverable("controller").unwrap();
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["reason"], "report complete");
    assert_eq!(board.deliverable("research").unwrap()["task"], "collect sources");
    assert_eq!(board.plan.as_ref().unwrap().status, hive::core::ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_react_quick_retries_system_failure_without_reflection() {
    let llm = Arc::new(
        ScriptedLlmClient::new().reply(r#"{"tasks":[{"agent":"fetch","description":"download"}]}"#),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut cfg = config();
    cfg.runtime.max_error_retries = 2;
    let orch = OrchestratorBuilder::new(cfg)
        .mode(ProcessMode::React)
        .llm(llm.clone())
        .agent(
            AgentSpec::new("fetch", "Fetch"),
            FnAgent::new(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::System("object store unavailable".into()))
            }),
        )
        .build()
        .unwrap();

    let (events, err) = collect(orch.stream("download", "react-sys")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 只有规划调用，没有反思调用
    assert_eq!(llm.call_count(), 1);
    assert!(matches!(err, Some(OrchestratorError::Agent(_))));
    assert_eq!(last_event(&events), EventType::AgentFailed);

    let board = orch.load_session("react-sys").await.unwrap();
    let plan = board.plan.unwrap();
    assert_eq!(plan.status, hive::core::ExecutionStatus::Failed);
    assert_eq!(plan.tasks[0].failure_kind, Some(hive::core::FailureKind::System));
}
